//! Staging store backed by the shared storage provider.

use async_trait::async_trait;
use object_store::path::Path as ObjectPath;
use std::collections::BTreeSet;
use std::path::Path;

use openaire_core::storage::StorageProvider;

use super::StagingStore;
use crate::error::StorageError;

/// Multipart parts in flight per upload.
const MAX_CONCURRENT_PARTS: usize = 4;

#[async_trait]
impl StagingStore for StorageProvider {
    async fn list_objects(&self, prefix: &str) -> Result<BTreeSet<String>, StorageError> {
        let prefix = ObjectPath::from(prefix);
        let depth = prefix.parts().count() + 1;

        Ok(self
            .list_with_prefix(prefix.as_ref())
            .await?
            .into_iter()
            .filter(|path| path.parts().count() == depth)
            .filter_map(|path| path.filename().map(str::to_string))
            .collect())
    }

    async fn upload(&self, local_path: &Path, remote_name: &str) -> Result<u64, StorageError> {
        self.upload_file(local_path, &ObjectPath::from(remote_name), MAX_CONCURRENT_PARTS)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_list_objects_returns_direct_children_only() {
        let root = TempDir::new().unwrap();
        let table = root.path().join("openaire/publication");
        std::fs::create_dir_all(table.join("nested")).unwrap();
        std::fs::write(table.join("part-0_NR.json.gz"), b"a").unwrap();
        std::fs::write(table.join("nested/part-9_NR.json.gz"), b"b").unwrap();
        std::fs::create_dir_all(root.path().join("openaire/publication_old")).unwrap();
        std::fs::write(
            root.path().join("openaire/publication_old/part-1_NR.json.gz"),
            b"c",
        )
        .unwrap();

        let store = StorageProvider::for_url(root.path().to_str().unwrap(), None)
            .await
            .unwrap();
        let names = store.list_objects("openaire/publication").await.unwrap();

        assert_eq!(
            names,
            BTreeSet::from(["part-0_NR.json.gz".to_string()])
        );
    }

    #[tokio::test]
    async fn test_upload_then_list() {
        let root = TempDir::new().unwrap();
        let local = TempDir::new().unwrap();
        let file = local.path().join("part-1.json.gz");
        std::fs::write(&file, b"data").unwrap();

        let store = StorageProvider::for_url(root.path().to_str().unwrap(), None)
            .await
            .unwrap();
        let sent = store
            .upload(&file, "openaire/relation/part-1.json.gz")
            .await
            .unwrap();

        assert_eq!(sent, 4);
        assert!(
            store
                .list_objects("openaire/relation")
                .await
                .unwrap()
                .contains("part-1.json.gz")
        );
    }
}
