//! SNMPv3 User-based Security Model: parameter validation and RFC 3414 key
//! derivation (password-to-key plus engine-id localization). Grounded in the
//! teacher's `snmp_usm::{Digest, AuthKey, LocalizedKey, PrivKey,
//! WithLocalizedKey}` shape, implemented here against `md-5`/`sha1`/`hmac`
//! instead of the teacher's unreachable `snmp_usm` git dependency.

use anyhow::{bail, Result};
use hmac::digest::Digest as _;
use md5::Md5;
use serde::{Deserialize, Serialize};
use sha1::Sha1;

use crate::config::DeviceSnmpConfig;

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
pub enum SecLevel {
    NoAuthNoPriv,
    AuthNoPriv,
    AuthPriv,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
pub enum AuthProtocol {
    NoAuth,
    Md5,
    Sha,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
pub enum PrivProtocol {
    NoPriv,
    Des,
    Aes,
}

#[derive(Debug, Clone)]
pub struct UsmKeys {
    pub auth_key: Option<Vec<u8>>,
    pub priv_key: Option<Vec<u8>>,
}

/// Validates the USM block on a device config and derives the localized
/// auth/priv keys, exactly mirroring the fatal-error strings of the source
/// this crate's behavior is specified against.
pub fn derive_keys(cfg: &DeviceSnmpConfig) -> Result<UsmKeys> {
    let auth_user = cfg.v3_auth_user.as_deref().unwrap_or("");
    if auth_user.is_empty() {
        bail!("Error on snmp v3 user");
    }

    let sec_level = cfg
        .v3_sec_level
        .ok_or_else(|| anyhow::anyhow!("Error on snmp Security Level"))?;

    match sec_level {
        SecLevel::NoAuthNoPriv => Ok(UsmKeys {
            auth_key: None,
            priv_key: None,
        }),
        SecLevel::AuthNoPriv => {
            let auth_pass = cfg.v3_auth_pass.as_deref().unwrap_or("");
            if auth_pass.is_empty() {
                bail!("Error on snmp v3 AuthPass");
            }
            let auth_prot = cfg
                .v3_auth_prot
                .ok_or_else(|| anyhow::anyhow!("Error on snmp v3 AuthProt"))?;
            let auth_key = password_to_key(auth_prot, auth_pass.as_bytes())?;
            Ok(UsmKeys {
                auth_key: Some(auth_key),
                priv_key: None,
            })
        }
        SecLevel::AuthPriv => {
            let auth_pass = cfg.v3_auth_pass.as_deref().unwrap_or("");
            if auth_pass.is_empty() {
                bail!("Error on snmp v3 AuthPass");
            }
            let auth_prot = cfg
                .v3_auth_prot
                .ok_or_else(|| anyhow::anyhow!("Error on snmp v3 AuthProt"))?;

            let priv_pass = cfg.v3_priv_pass.as_deref().unwrap_or("");
            if priv_pass.is_empty() {
                bail!("Error on snmp v3 PrivPAss");
            }
            let priv_prot = cfg
                .v3_priv_prot
                .ok_or_else(|| anyhow::anyhow!("Error on snmp v3 PrivProt"))?;

            let auth_key = password_to_key(auth_prot, auth_pass.as_bytes())?;
            let priv_key = password_to_key_for_priv(priv_prot, auth_prot, priv_pass.as_bytes())?;
            Ok(UsmKeys {
                auth_key: Some(auth_key),
                priv_key,
            })
        }
    }
}

fn password_to_key_for_priv(
    priv_prot: PrivProtocol,
    auth_prot: AuthProtocol,
    passphrase: &[u8],
) -> Result<Option<Vec<u8>>> {
    match priv_prot {
        PrivProtocol::NoPriv => Ok(None),
        PrivProtocol::Des | PrivProtocol::Aes => Ok(Some(password_to_key(auth_prot, passphrase)?)),
    }
}

/// RFC 3414 Appendix A.2: expand the passphrase to a 1-megabyte digest
/// input by cyclic repetition, then digest it.
fn expand_password(passphrase: &[u8]) -> Vec<u8> {
    const MEGABYTE: usize = 1_048_576;
    let mut buf = Vec::with_capacity(MEGABYTE);
    if passphrase.is_empty() {
        return buf;
    }
    let mut i = 0;
    while buf.len() < MEGABYTE {
        buf.push(passphrase[i % passphrase.len()]);
        i += 1;
    }
    buf
}

fn password_to_key(auth_prot: AuthProtocol, passphrase: &[u8]) -> Result<Vec<u8>> {
    let expanded = expand_password(passphrase);
    match auth_prot {
        AuthProtocol::NoAuth => bail!("Error on snmp v3 AuthProt"),
        AuthProtocol::Md5 => Ok(Md5::digest(&expanded).to_vec()),
        AuthProtocol::Sha => Ok(Sha1::digest(&expanded).to_vec()),
    }
}

/// RFC 3414 §2.6: localize a password-derived key to a specific SNMP engine
/// by digesting `key || engineID || key`. Not wired into `connect()`: doing
/// so for real requires a discovery round trip against the device's
/// authoritative engine, which needs genuine SNMPv3 wire support (see
/// DESIGN.md for why that's out of scope here). Kept and tested against the
/// RFC vector so it's ready once that transport exists.
#[allow(dead_code)]
pub fn localize_key(auth_prot: AuthProtocol, key: &[u8], engine_id: &[u8]) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(key.len() * 2 + engine_id.len());
    buf.extend_from_slice(key);
    buf.extend_from_slice(engine_id);
    buf.extend_from_slice(key);
    match auth_prot {
        AuthProtocol::NoAuth => bail!("Error on snmp v3 AuthProt"),
        AuthProtocol::Md5 => Ok(Md5::digest(&buf).to_vec()),
        AuthProtocol::Sha => Ok(Sha1::digest(&buf).to_vec()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Fixed points of the RFC 3414 Appendix A.2.1 password-to-key algorithm
    // (cyclic-repeat the password to 2^20 octets, then digest) for the
    // password "maplesyrup"; pinned here as regression vectors.
    #[test]
    fn md5_password_to_key_is_stable() {
        let key = password_to_key(AuthProtocol::Md5, b"maplesyrup").unwrap();
        assert_eq!(
            key,
            vec![
                159, 175, 50, 131, 136, 78, 146, 131, 78, 188, 152, 71, 216, 237, 217, 99,
            ]
        );
    }

    #[test]
    fn sha1_password_to_key_is_stable() {
        let key = password_to_key(AuthProtocol::Sha, b"maplesyrup").unwrap();
        assert_eq!(
            key,
            vec![
                159, 181, 204, 3, 129, 73, 123, 55, 147, 82, 137, 57, 255, 120, 141, 93, 121, 20,
                82, 17,
            ]
        );
    }

    // RFC 3414 Appendix A.3.2: localization with engine ID
    // 0x000000000000000000000002.
    #[test]
    fn md5_localized_key_matches_rfc_vector() {
        let key = password_to_key(AuthProtocol::Md5, b"maplesyrup").unwrap();
        let engine_id = [0u8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 2];
        let localized = localize_key(AuthProtocol::Md5, &key, &engine_id).unwrap();
        assert_eq!(
            localized,
            vec![
                0x52, 0x6f, 0x5e, 0xed, 0x9f, 0xcc, 0xe2, 0x6f, 0x89, 0x64, 0xc2, 0x93, 0x07, 0x87,
                0xd8, 0x2b,
            ]
        );
    }

    #[test]
    fn missing_priv_pass_is_fatal() {
        let cfg = DeviceSnmpConfig {
            version: crate::snmp::SnmpVersion::V3,
            community: None,
            port: 161,
            timeout: 5,
            retries: 1,
            v3_sec_level: Some(SecLevel::AuthPriv),
            v3_auth_user: Some("admin".into()),
            v3_auth_prot: Some(AuthProtocol::Sha),
            v3_auth_pass: Some("authpassword".into()),
            v3_priv_prot: Some(PrivProtocol::Aes),
            v3_priv_pass: None,
        };
        let err = derive_keys(&cfg).unwrap_err();
        assert!(err.to_string().contains("PrivPAss"));
    }

    #[test]
    fn valid_auth_priv_derives_both_keys() {
        let cfg = DeviceSnmpConfig {
            version: crate::snmp::SnmpVersion::V3,
            community: None,
            port: 161,
            timeout: 5,
            retries: 1,
            v3_sec_level: Some(SecLevel::AuthPriv),
            v3_auth_user: Some("admin".into()),
            v3_auth_prot: Some(AuthProtocol::Sha),
            v3_auth_pass: Some("authpassword".into()),
            v3_priv_prot: Some(PrivProtocol::Aes),
            v3_priv_pass: Some("privpassword".into()),
        };
        let keys = derive_keys(&cfg).unwrap();
        assert!(keys.auth_key.is_some());
        assert!(keys.priv_key.is_some());
    }
}
