//! Certificate factory.
//!
//! Computes SAN sets for the serving record and (re)signs its leaf
//! certificate with the CA. The authoritative SAN set of a record lives in
//! its `listener.cattle.io/cn-*` annotations; the certificate is always
//! derived from them, sorted, so identical SAN sets sign identical
//! DNS/IP lists.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;

use dynlistener_cert::{
    marshal_chain, new_private_key, new_signed_cert, parse_cert_pem, parse_private_key_pem,
    AltNames, CaKeypair, CertConfig,
};
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::FactoryError;
use crate::secret::{TlsSecret, CN_PREFIX, FINGERPRINT_ANNOTATION};

/// Names allowed in a SAN: hostnames, IPv4 and IPv6 literals
static CN_REGEXP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([A-Za-z0-9:][-A-Za-z0-9_.:]*)?[A-Za-z0-9:]$").expect("valid CN regex")
});

/// Longest annotation name part allowed by Kubernetes
const MAX_ANNOTATION_NAME_LEN: usize = 63;

/// Predicate restricting which names may enter the SAN set.
pub type FilterFn = Arc<dyn Fn(&[String]) -> Vec<String> + Send + Sync>;

/// Operations the listener needs from a certificate factory.
pub trait TlsFactory: Send + Sync {
    /// Re-sign the record with its current SAN set.
    fn renew(&self, secret: &TlsSecret) -> Result<TlsSecret, FactoryError>;

    /// Add names to the record, re-signing when the SAN set grows.
    fn add_cn(&self, secret: &TlsSecret, names: &[String])
        -> Result<(TlsSecret, bool), FactoryError>;

    /// Fold `additional`'s SANs into `target`.
    fn merge(
        &self,
        target: &TlsSecret,
        additional: &TlsSecret,
    ) -> Result<(TlsSecret, bool), FactoryError>;

    /// Names from `names` that may be added.
    fn filter(&self, names: &[String]) -> Vec<String>;

    /// Rebuild the record from scratch with a new key and the same SANs.
    fn regenerate(&self, secret: &TlsSecret) -> Result<TlsSecret, FactoryError>;
}

/// Annotation key recording `name` in the SAN set.
pub fn annotation_key(name: &str) -> String {
    let sanitized = name.replace(':', "_");
    let key_name = format!("cn-{}", sanitized);
    if key_name.len() <= MAX_ANNOTATION_NAME_LEN {
        return format!("{}{}", CN_PREFIX, sanitized);
    }

    let digest = hex::encode(Sha256::digest(name.as_bytes()));
    let head: String = sanitized.chars().take(47).collect();
    format!("{}{}-{}", CN_PREFIX, head, &digest[..12])
}

/// Returns `true` if the record is user-provided.
pub fn is_static(secret: &TlsSecret) -> bool {
    secret.is_static()
}

/// SAN names recorded in the annotations.
pub fn cns(secret: &TlsSecret) -> Vec<String> {
    secret
        .annotations()
        .iter()
        .filter(|(k, _)| k.starts_with(CN_PREFIX))
        .map(|(_, v)| v.clone())
        .collect()
}

/// Split names into sorted, deduplicated DNS names and IP addresses.
pub fn collect_cns(names: &[String]) -> AltNames {
    let sorted: BTreeSet<&str> = names.iter().map(String::as_str).collect();

    let mut alt_names = AltNames::default();
    for name in sorted {
        match name.parse::<IpAddr>() {
            Ok(ip) => alt_names.ips.push(ip),
            Err(_) => alt_names.dns_names.push(name.to_string()),
        }
    }
    alt_names
}

/// Whether adding `names` would change the record.
///
/// A record without a certificate always needs an update. Once the SAN count
/// reaches `max_sans` (when non-zero) unseen names are refused.
pub fn needs_update(max_sans: usize, secret: &TlsSecret, names: &[String]) -> bool {
    if secret.cert_pem().is_empty() {
        return true;
    }

    for name in names {
        if !secret.annotations().contains_key(&annotation_key(name)) {
            if max_sans > 0 && cns(secret).len() >= max_sans {
                debug!(name = %name, max_sans, "SAN limit reached, not adding name");
                return false;
            }
            return true;
        }
    }
    false
}

/// Wrap `filter` so configured SANs always pass it.
///
/// Returns `None` when there is no filter to wrap.
pub fn allow_default_sans(sans: &[String], filter: Option<FilterFn>) -> Option<FilterFn> {
    let next = filter?;
    if sans.is_empty() {
        return Some(next);
    }

    let allowed: BTreeSet<String> = sans.iter().cloned().collect();
    Some(Arc::new(move |names: &[String]| {
        let (mut good, unknown): (Vec<String>, Vec<String>) =
            names.iter().cloned().partition(|n| allowed.contains(n));
        good.extend(next(&unknown));
        good
    }))
}

/// [`TlsFactory`] signing with a local CA.
pub struct CertFactory {
    ca: Arc<CaKeypair>,
    common_name: String,
    organization: Vec<String>,
    filter_cn: Option<FilterFn>,
    max_sans: usize,
}

impl CertFactory {
    pub fn new(ca: Arc<CaKeypair>, common_name: impl Into<String>, organization: Vec<String>) -> Self {
        Self {
            ca,
            common_name: common_name.into(),
            organization,
            filter_cn: None,
            max_sans: 0,
        }
    }

    pub fn with_filter(mut self, filter: Option<FilterFn>) -> Self {
        self.filter_cn = filter;
        self
    }

    /// Cap the SAN count; 0 means unlimited.
    pub fn with_max_sans(mut self, max_sans: usize) -> Self {
        self.max_sans = max_sans;
        self
    }

    pub fn ca(&self) -> &CaKeypair {
        &self.ca
    }

    /// Sign a certificate for the record's SAN set and store it with the key.
    fn generate_cert(&self, mut secret: TlsSecret, new_key: bool) -> Result<TlsSecret, FactoryError> {
        let names = cns(&secret);
        let alt_names = collect_cns(&names);

        let key = if new_key || secret.key_pem().is_empty() {
            new_private_key().map_err(FactoryError::context("generate private key"))?
        } else {
            parse_private_key_pem(secret.key_pem())
                .map_err(FactoryError::context("parse private key"))?
        };

        if !secret.cert_pem().is_empty() {
            if let Ok(existing) = parse_cert_pem(secret.cert_pem()) {
                if let Err(e) = existing.verify_signed_by(self.ca.cert()) {
                    warn!(error = %e, "Existing certificate not signed by current CA, issuer will change");
                }
            }
        }

        let config = CertConfig {
            common_name: self.common_name.clone(),
            organization: self.organization.clone(),
            alt_names,
        };
        let leaf = new_signed_cert(&config, &key, &self.ca)
            .map_err(FactoryError::context("sign certificate"))?;
        let (chain_pem, key_pem) = marshal_chain(&leaf, &key, self.ca.cert());

        secret.set_cert_and_key(chain_pem.into_bytes(), key_pem.into_bytes());
        secret
            .annotations_mut()
            .insert(FINGERPRINT_ANNOTATION.to_string(), leaf.fingerprint());

        info!(
            sans = ?names,
            fingerprint = %leaf.fingerprint(),
            "Generated serving certificate"
        );
        Ok(secret)
    }
}

impl TlsFactory for CertFactory {
    fn filter(&self, names: &[String]) -> Vec<String> {
        match &self.filter_cn {
            Some(filter) => filter(names),
            None => names.to_vec(),
        }
    }

    fn add_cn(
        &self,
        secret: &TlsSecret,
        names: &[String],
    ) -> Result<(TlsSecret, bool), FactoryError> {
        let names = self.filter(names);
        if is_static(secret) || !needs_update(self.max_sans, secret, &names) {
            return Ok((secret.clone(), false));
        }

        let mut updated = secret.clone();
        let mut added = false;
        for name in &names {
            if !CN_REGEXP.is_match(name) {
                warn!(name = %name, "Dropping invalid CN");
                continue;
            }

            let key = annotation_key(name);
            if updated.annotations().contains_key(&key) {
                continue;
            }
            if self.max_sans > 0 && cns(&updated).len() >= self.max_sans {
                debug!(name = %name, max_sans = self.max_sans, "SAN limit reached, not adding name");
                break;
            }
            updated.annotations_mut().insert(key, name.clone());
            added = true;
        }

        if !added && !secret.cert_pem().is_empty() {
            return Ok((secret.clone(), false));
        }

        let updated = self.generate_cert(updated, false)?;
        Ok((updated, true))
    }

    fn renew(&self, secret: &TlsSecret) -> Result<TlsSecret, FactoryError> {
        if is_static(secret) {
            return Err(FactoryError::StaticCert);
        }
        self.generate_cert(secret.clone(), false)
    }

    fn regenerate(&self, secret: &TlsSecret) -> Result<TlsSecret, FactoryError> {
        if is_static(secret) {
            return Err(FactoryError::StaticCert);
        }

        let names = cns(secret);
        let mut fresh = TlsSecret::default();
        fresh.metadata.name = secret.metadata.name.clone();
        fresh.metadata.namespace = secret.metadata.namespace.clone();
        fresh.metadata.resource_version = secret.metadata.resource_version.clone();
        for name in names.iter().filter(|n| CN_REGEXP.is_match(n)) {
            fresh
                .annotations_mut()
                .insert(annotation_key(name), name.clone());
        }

        self.generate_cert(fresh, true)
    }

    fn merge(
        &self,
        target: &TlsSecret,
        additional: &TlsSecret,
    ) -> Result<(TlsSecret, bool), FactoryError> {
        let (secret, updated) = self.add_cn(target, &cns(additional))?;
        if !updated && target.fingerprint() != additional.fingerprint() {
            return Ok((additional.clone(), true));
        }
        Ok((secret, updated))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secret::STATIC_ANNOTATION;
    use dynlistener_cert::parse_certs_pem;
    use proptest::prelude::*;

    fn setup_factory() -> CertFactory {
        let ca = CaKeypair::generate("test-ca", "test-org").unwrap();
        CertFactory::new(Arc::new(ca), "dynamic", vec!["dynamic".to_string()])
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn leaf_info(secret: &TlsSecret) -> dynlistener_cert::CertInfo {
        parse_certs_pem(secret.cert_pem()).unwrap()[0].info().unwrap()
    }

    #[test]
    fn test_add_ip_to_fresh_record() {
        let factory = setup_factory();

        let (secret, updated) = factory
            .add_cn(&TlsSecret::default(), &names(&["10.0.0.5"]))
            .unwrap();

        assert!(updated);
        assert_eq!(
            secret.annotations().get("listener.cattle.io/cn-10.0.0.5"),
            Some(&"10.0.0.5".to_string())
        );
        let info = leaf_info(&secret);
        assert_eq!(info.ip_addresses, vec!["10.0.0.5".parse::<IpAddr>().unwrap()]);
        assert!(info.dns_names.is_empty());
        assert_eq!(info.organizations, vec!["dynamic".to_string()]);
        assert_eq!(secret.fingerprint().map(|f| f.starts_with("SHA256=")), Some(true));
    }

    #[test]
    fn test_add_cn_idempotent() {
        let factory = setup_factory();

        let (first, updated) = factory
            .add_cn(&TlsSecret::default(), &names(&["svc.local"]))
            .unwrap();
        assert!(updated);

        let (second, updated) = factory.add_cn(&first, &names(&["svc.local"])).unwrap();
        assert!(!updated);
        assert_eq!(second, first);
    }

    #[test]
    fn test_add_cn_keeps_key() {
        let factory = setup_factory();

        let (first, _) = factory
            .add_cn(&TlsSecret::default(), &names(&["a.example"]))
            .unwrap();
        let (second, updated) = factory.add_cn(&first, &names(&["b.example"])).unwrap();

        assert!(updated);
        assert_eq!(second.key_pem(), first.key_pem());
        assert_ne!(second.cert_pem(), first.cert_pem());
        assert_eq!(leaf_info(&second).dns_names, names(&["a.example", "b.example"]));
    }

    #[test]
    fn test_add_cn_drops_invalid_names() {
        let factory = setup_factory();

        let (first, _) = factory
            .add_cn(&TlsSecret::default(), &names(&["good.example"]))
            .unwrap();
        let (second, updated) = factory
            .add_cn(&first, &names(&["bad name!", "-leading"]))
            .unwrap();

        assert!(!updated);
        assert_eq!(second, first);
    }

    #[test]
    fn test_add_cn_ipv6_annotation_key() {
        let factory = setup_factory();

        let (secret, _) = factory
            .add_cn(&TlsSecret::default(), &names(&["fd00::1"]))
            .unwrap();

        assert_eq!(
            secret.annotations().get("listener.cattle.io/cn-fd00__1"),
            Some(&"fd00::1".to_string())
        );
        assert_eq!(
            leaf_info(&secret).ip_addresses,
            vec!["fd00::1".parse::<IpAddr>().unwrap()]
        );
    }

    #[test]
    fn test_annotation_key_long_name() {
        let name = format!("{}.example.com", "a".repeat(70));
        let key = annotation_key(&name);

        let key_name = key.strip_prefix("listener.cattle.io/").unwrap();
        assert!(key_name.len() <= MAX_ANNOTATION_NAME_LEN);
        assert_eq!(key, annotation_key(&name));
        assert_ne!(key, annotation_key(&format!("{}.example.org", "a".repeat(70))));
    }

    #[test]
    fn test_static_record_unchanged() {
        let factory = setup_factory();
        let mut secret = TlsSecret::new_static("cert", "key");
        secret
            .annotations_mut()
            .insert(STATIC_ANNOTATION.to_string(), "true".to_string());

        let (same, updated) = factory.add_cn(&secret, &names(&["new.example"])).unwrap();
        assert!(!updated);
        assert_eq!(same, secret);

        assert!(factory.renew(&secret).unwrap_err().is_static_cert());
        assert!(factory.regenerate(&secret).unwrap_err().is_static_cert());
    }

    #[test]
    fn test_needs_update_max_sans() {
        let factory = setup_factory();
        let (secret, _) = factory
            .add_cn(&TlsSecret::default(), &names(&["one.example"]))
            .unwrap();

        assert!(!needs_update(1, &secret, &names(&["new-name"])));
        assert!(!needs_update(1, &secret, &names(&["one.example"])));
        assert!(needs_update(2, &secret, &names(&["new-name"])));
        assert!(needs_update(0, &secret, &names(&["new-name"])));
        assert!(needs_update(1, &TlsSecret::default(), &names(&["new-name"])));
    }

    #[test]
    fn test_add_cn_honours_max_sans() {
        let factory = setup_factory().with_max_sans(2);

        let (secret, updated) = factory
            .add_cn(&TlsSecret::default(), &names(&["a.example", "b.example", "c.example"]))
            .unwrap();

        assert!(updated);
        assert_eq!(cns(&secret).len(), 2);

        let (same, updated) = factory.add_cn(&secret, &names(&["d.example"])).unwrap();
        assert!(!updated);
        assert_eq!(same, secret);
    }

    #[test]
    fn test_renew_keeps_sans_and_key() {
        let factory = setup_factory();
        let (secret, _) = factory
            .add_cn(&TlsSecret::default(), &names(&["a.example", "10.0.0.1"]))
            .unwrap();

        let renewed = factory.renew(&secret).unwrap();

        assert_eq!(renewed.key_pem(), secret.key_pem());
        assert_eq!(cns(&renewed), cns(&secret));
        assert_ne!(renewed.fingerprint(), secret.fingerprint());
        let info = leaf_info(&renewed);
        assert_eq!(info.dns_names, names(&["a.example"]));
    }

    #[test]
    fn test_regenerate_replaces_key() {
        let factory = setup_factory();
        let (mut secret, _) = factory
            .add_cn(&TlsSecret::default(), &names(&["a.example"]))
            .unwrap();
        secret
            .annotations_mut()
            .insert("example.com/unrelated".to_string(), "x".to_string());

        let regenerated = factory.regenerate(&secret).unwrap();

        assert_ne!(regenerated.key_pem(), secret.key_pem());
        assert_eq!(cns(&regenerated), names(&["a.example"]));
        assert!(!regenerated.annotations().contains_key("example.com/unrelated"));
    }

    #[test]
    fn test_merge_adds_missing_names() {
        let factory = setup_factory();
        let (target, _) = factory
            .add_cn(&TlsSecret::default(), &names(&["a.example"]))
            .unwrap();
        let (additional, _) = factory
            .add_cn(&TlsSecret::default(), &names(&["b.example"]))
            .unwrap();

        let (merged, updated) = factory.merge(&target, &additional).unwrap();

        assert!(updated);
        assert_eq!(merged.key_pem(), target.key_pem());
        assert_eq!(cns(&merged), names(&["a.example", "b.example"]));
    }

    #[test]
    fn test_merge_accepts_renewed_record() {
        let factory = setup_factory();
        let (target, _) = factory
            .add_cn(&TlsSecret::default(), &names(&["a.example"]))
            .unwrap();
        let renewed = factory.renew(&target).unwrap();

        let (merged, updated) = factory.merge(&target, &renewed).unwrap();
        assert!(updated);
        assert_eq!(merged, renewed);

        let (merged, updated) = factory.merge(&target, &target).unwrap();
        assert!(!updated);
        assert_eq!(merged, target);
    }

    #[test]
    fn test_filter_and_default_sans() {
        let allow_only_example: FilterFn = Arc::new(|names: &[String]| {
            names
                .iter()
                .filter(|n| n.ends_with(".example"))
                .cloned()
                .collect()
        });
        let filter = allow_default_sans(&names(&["localhost"]), Some(allow_only_example)).unwrap();

        let ca = CaKeypair::generate("test-ca", "test-org").unwrap();
        let factory = CertFactory::new(Arc::new(ca), "dynamic", vec![]).with_filter(Some(filter));

        assert_eq!(
            factory.filter(&names(&["localhost", "evil.com", "ok.example"])),
            names(&["localhost", "ok.example"])
        );
        assert!(allow_default_sans(&names(&["localhost"]), None).is_none());
        assert_eq!(setup_factory().filter(&names(&["any"])), names(&["any"]));
    }

    #[test]
    fn test_collect_cns_sorted_and_split() {
        let alt = collect_cns(&names(&["z.example", "10.0.0.2", "a.example", "10.0.0.1", "a.example"]));

        assert_eq!(alt.dns_names, names(&["a.example", "z.example"]));
        assert_eq!(
            alt.ips,
            vec![
                "10.0.0.1".parse::<IpAddr>().unwrap(),
                "10.0.0.2".parse::<IpAddr>().unwrap()
            ]
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(8))]

        #[test]
        fn test_san_growth_order_independent(
            set in proptest::collection::btree_set("[a-z]{1,8}\\.example", 1..5),
        ) {
            let factory = setup_factory();
            let forward: Vec<String> = set.iter().cloned().collect();
            let mut reverse = forward.clone();
            reverse.reverse();

            let mut a = TlsSecret::default();
            for name in &forward {
                a = factory.add_cn(&a, std::slice::from_ref(name)).unwrap().0;
            }
            let mut b = TlsSecret::default();
            for name in &reverse {
                b = factory.add_cn(&b, std::slice::from_ref(name)).unwrap().0;
            }

            prop_assert_eq!(cns(&a), forward.clone());
            prop_assert_eq!(cns(&b), forward.clone());
            prop_assert_eq!(leaf_info(&a).dns_names, leaf_info(&b).dns_names);
        }
    }
}
