//! `CloudTransformer`: the single end-to-end-encryption extension point.

use crate::error::SyncError;
use crate::types::Payload;

/// `encrypt`/`decrypt` must be total and mutually inverse:
/// `decrypt(encrypt(x)) == x`. Errors are classified as permanent
/// ([`crate::error::ErrorKind::TransformFailure`]) by the callers.
pub trait CloudTransformer: Send + Sync {
    fn encrypt(&self, table: &str, key: &str, fields: &Payload) -> Result<Payload, SyncError>;
    fn decrypt(&self, table: &str, key: &str, fields: &Payload) -> Result<Payload, SyncError>;
}

/// Default transformer: the identity function.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityTransformer;

impl CloudTransformer for IdentityTransformer {
    fn encrypt(&self, _table: &str, _key: &str, fields: &Payload) -> Result<Payload, SyncError> {
        Ok(fields.clone())
    }

    fn decrypt(&self, _table: &str, _key: &str, fields: &Payload) -> Result<Payload, SyncError> {
        Ok(fields.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_transformer_round_trips() {
        let t = IdentityTransformer;
        let mut payload = Payload::new();
        payload.insert("a".into(), serde_json::json!(1));
        let enc = t.encrypt("T", "1", &payload).unwrap();
        let dec = t.decrypt("T", "1", &enc).unwrap();
        assert_eq!(dec, payload);
    }
}
