//! Remote query client + persistence backends for vmsync.

mod memory;
mod postgres;
pub mod remote;
mod store;

use sha2::{Digest, Sha256};

pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use remote::{
    BackoffPolicy, CredentialProvider, DataTable, RemoteClientConfig, RemoteError,
    RemoteQueryClient, RemoteResponse, StaticCredentialProvider, ViewFilter,
};
pub use store::{AggregateStore, CircuitStore, PipelineStore, SnapshotStore, SyncLogStore};

pub const CRATE_NAME: &str = "vmsync-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hashing_is_stable() {
        let hash = sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }
}
