use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use strata_core::{ObjectMeta, ResourceKey, ResourceVersion, StorageError, StorageResult, VersionMatch};
use strata_select::Predicate;

/// Expected identity/version a mutation must match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Preconditions {
    pub uid: Option<String>,
    pub resource_version: Option<String>,
}

impl Preconditions {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn uid(uid: impl Into<String>) -> Self {
        Self { uid: Some(uid.into()), resource_version: None }
    }

    pub fn resource_version(rv: impl Into<String>) -> Self {
        Self { uid: None, resource_version: Some(rv.into()) }
    }

    pub fn is_empty(&self) -> bool {
        self.uid.is_none() && self.resource_version.is_none()
    }

    /// `Conflict` when `meta` does not satisfy the preconditions.
    pub fn check(&self, key: &ResourceKey, meta: &ObjectMeta) -> StorageResult<()> {
        if let Some(uid) = self.uid.as_deref() {
            if uid != meta.uid {
                return Err(StorageError::Conflict(format!(
                    "precondition failed for {}: uid in precondition: {}, uid in object meta: {}",
                    key, uid, meta.uid
                )));
            }
        }
        if let Some(rv) = self.resource_version.as_deref() {
            if rv != meta.resource_version {
                return Err(StorageError::Conflict(format!(
                    "precondition failed for {}: resource version in precondition: {}, resource version in object meta: {}",
                    key, rv, meta.resource_version
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    /// Minimum acceptable object RV; "" or "0" accepts anything.
    pub resource_version: String,
    /// Return `T::default()` instead of `NotFound`.
    pub ignore_not_found: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub resource_version: String,
    pub resource_version_match: VersionMatch,
    pub predicate: Predicate,
}

impl ListOptions {
    pub fn with_predicate(predicate: Predicate) -> Self {
        Self { predicate, ..Default::default() }
    }
}

#[derive(Debug, Clone, Default)]
pub struct WatchOptions {
    pub resource_version: String,
    pub predicate: Predicate,
    /// `None` sends initial events only when no resource version is given.
    pub send_initial_events: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct ObjectList<T> {
    pub items: Vec<T>,
    pub resource_version: ResourceVersion,
    /// Empty on the last page.
    pub continue_token: String,
}

/// Position of the next page: the backend page to re-read at `rv` and how
/// many of its items were already returned.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ContinueToken {
    pub rv: ResourceVersion,
    pub start: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub skip: usize,
}

fn is_zero(v: &usize) -> bool {
    *v == 0
}

impl ContinueToken {
    pub fn encode(&self) -> StorageResult<String> {
        Ok(URL_SAFE_NO_PAD.encode(serde_json::to_vec(self)?))
    }

    pub fn decode(token: &str) -> StorageResult<Self> {
        let invalid = || StorageError::InvalidRequest(format!("invalid continue token: {:?}", token));
        let bytes = URL_SAFE_NO_PAD.decode(token.as_bytes()).map_err(|_| invalid())?;
        let tok: ContinueToken = serde_json::from_slice(&bytes).map_err(|_| invalid())?;
        if tok.rv == 0 {
            return Err(invalid());
        }
        Ok(tok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::GroupResource;

    #[test]
    fn preconditions_compare_uid_and_rv() {
        let key = ResourceKey::new(&GroupResource::new("g", "r"), "ns", "n");
        let meta = ObjectMeta { uid: "u1".into(), resource_version: "5".into(), ..Default::default() };
        assert!(Preconditions::none().check(&key, &meta).is_ok());
        assert!(Preconditions::uid("u1").check(&key, &meta).is_ok());
        assert!(Preconditions::uid("u2").check(&key, &meta).unwrap_err().is_conflict());
        assert!(Preconditions::resource_version("5").check(&key, &meta).is_ok());
        assert!(Preconditions::resource_version("4").check(&key, &meta).unwrap_err().is_conflict());
    }

    #[test]
    fn continue_token_is_opaque_and_validated() {
        let tok = ContinueToken { rv: 42, start: "/group/g/resource/r/name/b".into(), skip: 3 };
        let s = tok.encode().unwrap();
        assert!(!s.contains('/'));
        assert_eq!(ContinueToken::decode(&s).unwrap(), tok);
        assert!(matches!(ContinueToken::decode("%%%"), Err(StorageError::InvalidRequest(_))));
        let zero = ContinueToken { rv: 0, ..Default::default() }.encode().unwrap();
        assert!(ContinueToken::decode(&zero).is_err());
    }
}
