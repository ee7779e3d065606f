//! Local HTTPS certificate covering every site hostname
//!
//! One self-signed CA certificate is issued for `localhost` plus all site
//! hosts and installed in the system trust store. Before a new one is
//! trusted, every earlier certificate with the same common name is removed.

use crate::error::{Error, IoResultExt, Result};
use crate::exec::{CommandRunner, CommandSpec};
use chrono::{Datelike, Utc};
use rcgen::{
    date_time_ymd, BasicConstraints, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, PKCS_ECDSA_P256_SHA256,
};
use std::collections::BTreeSet;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const COMMON_NAME: &str = "portside.dev";
const VALIDITY_YEARS: i32 = 10;
/// Reuse only certificates with at least this much validity left
const MIN_REMAINING_DAYS: i64 = 30;
/// Upper bound on trust store deletions, one per stale certificate
const MAX_TRUST_REMOVALS: usize = 20;

/// When an existing certificate may be kept
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReissuePolicy {
    /// Full rebuild: always issue a fresh certificate
    Always,
    /// Light refresh: keep the current one if its names still match
    IfMissingOrChanged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertificateStatus {
    Reused,
    Issued,
}

/// Names the certificate must cover
pub fn subject_alt_names(hostnames: &[String]) -> Vec<String> {
    let mut names = vec!["localhost".to_string()];
    for host in hostnames {
        if !names.contains(host) {
            names.push(host.clone());
        }
    }
    names
}

/// PEM encoded certificate and private key
pub struct GeneratedCertificate {
    pub cert_pem: String,
    pub key_pem: String,
}

pub fn generate(names: &[String]) -> Result<GeneratedCertificate> {
    let cert_error = |e: rcgen::Error| Error::Certificate(e.to_string());

    let mut params = CertificateParams::new(names.to_vec()).map_err(cert_error)?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, COMMON_NAME);
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyCertSign,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let today = Utc::now().date_naive();
    // day capped at 28 so the expiry date exists in every year
    let (month, day) = (today.month() as u8, today.day().min(28) as u8);
    params.not_before = date_time_ymd(today.year(), month, day);
    params.not_after = date_time_ymd(today.year() + VALIDITY_YEARS, month, day);

    let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).map_err(cert_error)?;
    let cert = params.self_signed(&key_pair).map_err(cert_error)?;

    Ok(GeneratedCertificate {
        cert_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
    })
}

/// DNS names of an existing certificate, `None` if it is missing, unreadable or about to expire
pub fn existing_names(cert_path: &Path) -> Option<BTreeSet<String>> {
    use x509_parser::prelude::*;

    let data = std::fs::read(cert_path).ok()?;
    let der = rustls_pemfile::certs(&mut BufReader::new(&data[..]))
        .filter_map(|c| c.ok())
        .next()?;

    let (_, parsed) = match X509Certificate::from_der(der.as_ref()) {
        Ok(result) => result,
        Err(e) => {
            warn!(error = %e, path = %cert_path.display(), "Failed to parse certificate");
            return None;
        }
    };

    let remaining_days = (parsed.validity().not_after.timestamp() - Utc::now().timestamp()) / 86_400;
    if remaining_days < MIN_REMAINING_DAYS {
        info!(remaining_days, "Certificate expires soon, reissuing");
        return None;
    }

    let san = parsed.subject_alternative_name().ok()??;
    Some(
        san.value
            .general_names
            .iter()
            .filter_map(|name| match name {
                GeneralName::DNSName(dns) => Some(dns.to_string()),
                _ => None,
            })
            .collect(),
    )
}

/// System store that trusts the certificate
pub trait TrustStore {
    /// Remove every trusted certificate with this common name
    fn remove(&self, common_name: &str) -> Result<()>;
    fn add(&self, cert_path: &Path) -> Result<()>;
}

/// macOS keychain through `security`
pub struct Keychain<'a> {
    runner: &'a dyn CommandRunner,
    keychain: PathBuf,
}

impl<'a> Keychain<'a> {
    pub fn new(runner: &'a dyn CommandRunner, keychain: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            keychain: keychain.into(),
        }
    }
}

impl TrustStore for Keychain<'_> {
    fn remove(&self, common_name: &str) -> Result<()> {
        let keychain = self.keychain.to_string_lossy();
        // delete-certificate removes one match per call and fails once none are left
        for removed in 0..MAX_TRUST_REMOVALS {
            let spec = CommandSpec::new("sudo")
                .args(["security", "delete-certificate", "-c", common_name, &*keychain])
                .capture();
            if !self.runner.run(&spec)?.success {
                debug!(removed, "Removed previous certificates from keychain");
                return Ok(());
            }
        }
        warn!(common_name, "Stopped removing certificates after {} attempts", MAX_TRUST_REMOVALS);
        Ok(())
    }

    fn add(&self, cert_path: &Path) -> Result<()> {
        let spec = CommandSpec::new("sudo").args([
            "security".to_string(),
            "add-trusted-cert".to_string(),
            "-d".to_string(),
            "-r".to_string(),
            "trustRoot".to_string(),
            "-k".to_string(),
            self.keychain.to_string_lossy().into_owned(),
            cert_path.to_string_lossy().into_owned(),
        ]);
        self.runner.run(&spec)?;
        Ok(())
    }
}

/// Leaves trust to the user
pub struct NoTrustStore;

impl TrustStore for NoTrustStore {
    fn remove(&self, _common_name: &str) -> Result<()> {
        Ok(())
    }

    fn add(&self, cert_path: &Path) -> Result<()> {
        info!(path = %cert_path.display(), "Certificate written; add it to your trust store to avoid browser warnings");
        Ok(())
    }
}

/// Issues and installs the certificate
pub struct CertificateManager<'a> {
    cert_path: &'a Path,
    key_path: &'a Path,
    trust: &'a dyn TrustStore,
}

impl<'a> CertificateManager<'a> {
    pub fn new(cert_path: &'a Path, key_path: &'a Path, trust: &'a dyn TrustStore) -> Self {
        Self {
            cert_path,
            key_path,
            trust,
        }
    }

    /// Make sure a certificate for `hostnames` exists and is trusted
    pub fn ensure(&self, hostnames: &[String], policy: ReissuePolicy) -> Result<CertificateStatus> {
        let names = subject_alt_names(hostnames);

        if policy == ReissuePolicy::IfMissingOrChanged && self.key_path.is_file() {
            let wanted: BTreeSet<String> = names.iter().cloned().collect();
            if existing_names(self.cert_path).as_ref() == Some(&wanted) {
                debug!(path = %self.cert_path.display(), "Certificate covers all hosts, keeping it");
                return Ok(CertificateStatus::Reused);
            }
        }

        self.trust.remove(COMMON_NAME)?;
        let generated = generate(&names)?;
        self.save(&generated)?;
        self.trust.add(self.cert_path)?;

        info!(names = names.len(), path = %self.cert_path.display(), "Issued HTTPS certificate");
        Ok(CertificateStatus::Issued)
    }

    fn save(&self, generated: &GeneratedCertificate) -> Result<()> {
        if let Some(parent) = self.cert_path.parent() {
            std::fs::create_dir_all(parent).at(parent)?;
        }
        std::fs::write(self.cert_path, &generated.cert_pem).at(self.cert_path)?;

        #[cfg(unix)]
        {
            use std::io::Write;
            use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
            let mut file = std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(self.key_path)
                .at(self.key_path)?;
            // `mode` only applies on creation
            file.set_permissions(std::fs::Permissions::from_mode(0o600))
                .at(self.key_path)?;
            file.write_all(generated.key_pem.as_bytes()).at(self.key_path)?;
        }
        #[cfg(not(unix))]
        {
            std::fs::write(self.key_path, &generated.key_pem).at(self.key_path)?;
        }

        Ok(())
    }
}
