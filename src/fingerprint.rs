use crate::constants::FINGERPRINT_VERSION;
use crate::graph::{BaseSpec, LayerSpec};
use crate::hasher;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;

/// Content hash of a layer, used as its cache key and image tag
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Combines a unit name, its context hash and its dependency fingerprints.
    /// Dependency order is significant and must be the declared order.
    pub fn compute(unit: &str, context_hash: &str, deps: &[Fingerprint]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(FINGERPRINT_VERSION.as_bytes());
        hasher.update(b"\0");
        hasher.update(unit.as_bytes());
        hasher.update(b"\0");
        hasher.update(context_hash.as_bytes());
        for dep in deps {
            hasher.update(b"\0");
            hasher.update(dep.0.as_bytes());
        }
        Fingerprint(hasher.finalize().to_hex().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// `from` is the manifest digest of the stored image the base starts from,
/// `None` for `FROM scratch`.
pub fn fingerprint_base(base: &BaseSpec, from: Option<&str>) -> io::Result<Fingerprint> {
    let context_hash = hasher::hash_context(&base.context)?;
    Ok(Fingerprint::compute(
        &format!("base\0{}\0{}", base.dockerfile, from.unwrap_or("scratch")),
        &context_hash,
        &[],
    ))
}

/// `deps` starts with the base fingerprint, followed by the layer's
/// dependencies in declaration order.
pub fn fingerprint_layer(layer: &LayerSpec, deps: &[Fingerprint]) -> io::Result<Fingerprint> {
    let context_hash = hasher::hash_context(&layer.context)?;
    Ok(Fingerprint::compute(
        &format!("layer\0{}\0{}", layer.name, layer.dockerfile),
        &context_hash,
        deps,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(s: &str) -> Fingerprint {
        Fingerprint::compute(s, "ctx", &[])
    }

    #[test]
    fn test_compute_is_deterministic() {
        let deps = vec![fp("a"), fp("b")];
        assert_eq!(
            Fingerprint::compute("tools", "abc", &deps),
            Fingerprint::compute("tools", "abc", &deps)
        );
    }

    #[test]
    fn test_dependency_changes_propagate() {
        let one = Fingerprint::compute("app", "abc", &[fp("a")]);
        let two = Fingerprint::compute("app", "abc", &[fp("a2")]);
        assert_ne!(one, two);
    }

    #[test]
    fn test_boundaries_are_unambiguous() {
        let joined = Fingerprint::compute("ab", "c", &[]);
        let split = Fingerprint::compute("a", "bc", &[]);
        assert_ne!(joined, split);
    }

    #[test]
    fn test_fits_in_an_image_tag() {
        let f = fp("x");
        assert_eq!(f.as_str().len(), 64);
        assert_eq!(f.short().len(), 12);
    }

    #[test]
    fn test_base_follows_its_from_image() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("Dockerfile"), "FROM upstream:1\n").unwrap();
        let base = BaseSpec {
            context: dir.path().to_path_buf(),
            dockerfile: "Dockerfile".into(),
        };
        let v1 = fingerprint_base(&base, Some("sha256:aaaa")).unwrap();
        let v2 = fingerprint_base(&base, Some("sha256:bbbb")).unwrap();
        assert_ne!(v1, v2);
        assert_ne!(v1, fingerprint_base(&base, None).unwrap());
        assert_eq!(v1, fingerprint_base(&base, Some("sha256:aaaa")).unwrap());
    }
}
