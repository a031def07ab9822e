//! Implementations of the [crate::Storage] trait.

pub mod memory;
pub mod tokio;

/// Validates that a partition name contains only allowed characters.
///
/// Allowed characters: alphanumeric, dash ('-'), and underscore ('_').
pub(crate) fn validate_partition_name(partition: &str) -> Result<(), crate::Error> {
    if partition.is_empty()
        || partition
            .chars()
            .any(|c| !(c.is_ascii_alphanumeric() || ['_', '-'].contains(&c)))
    {
        return Err(crate::Error::PartitionNameInvalid(partition.into()));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use crate::{Blob, Error, Storage};

    /// Checks every behavior the cache directories rely on against `storage`.
    pub(crate) async fn run_storage_tests<S>(storage: S)
    where
        S: Storage + Send + Sync + 'static,
        S::Blob: Send + Sync,
    {
        test_open_and_write(&storage).await;
        test_remove(&storage).await;
        test_scan(&storage).await;
        test_overwrite_data(&storage).await;
        test_read_beyond_bound(&storage).await;
        test_write_at_large_offset(&storage).await;
        test_resize_then_open(&storage).await;
        test_partition_name_validation(&storage).await;
        test_read_zero_length(&storage).await;
        test_clones_share_writes(&storage).await;
        test_reopen_after_remove(&storage).await;
    }

    /// Test opening a blob, writing to it, and reading back the data.
    async fn test_open_and_write<S: Storage>(storage: &S) {
        let (blob, len) = storage.open("partition", b"test_blob").await.unwrap();
        assert_eq!(len, 0);

        blob.write_at(b"hello world".to_vec(), 0).await.unwrap();
        let read = blob.read_at(vec![0; 11], 0).await.unwrap();
        assert_eq!(read, b"hello world", "blob content does not match");
    }

    /// Test removing a blob from storage.
    async fn test_remove<S: Storage>(storage: &S) {
        storage.open("partition", b"test_blob").await.unwrap();
        storage
            .remove("partition", Some(b"test_blob"))
            .await
            .unwrap();

        let blobs = storage.scan("partition").await.unwrap();
        assert!(blobs.is_empty(), "blob was not removed");

        // Removing again reports the missing blob
        let result = storage.remove("partition", Some(b"test_blob")).await;
        assert!(matches!(result, Err(Error::BlobMissing(_, _))));
    }

    /// Test scanning a partition for blobs.
    async fn test_scan<S: Storage>(storage: &S) {
        storage.open("scanned", b"blob1").await.unwrap();
        storage.open("scanned", b"blob2").await.unwrap();

        let mut blobs = storage.scan("scanned").await.unwrap();
        blobs.sort();
        assert_eq!(blobs, vec![b"blob1".to_vec(), b"blob2".to_vec()]);

        // Removing the partition removes every blob in it
        storage.remove("scanned", None).await.unwrap();
        let result = storage.scan("scanned").await;
        assert!(matches!(result, Err(Error::PartitionMissing(_))));
    }

    /// Test overwriting data in a blob.
    async fn test_overwrite_data<S: Storage>(storage: &S) {
        let (blob, _) = storage.open("partition", b"overwrite").await.unwrap();

        blob.write_at(b"hello world".to_vec(), 0).await.unwrap();
        blob.write_at(b"HELLO".to_vec(), 0).await.unwrap();
        let read = blob.read_at(vec![0; 11], 0).await.unwrap();
        assert_eq!(read, b"HELLO world");
    }

    /// Test reading past the end of a blob.
    async fn test_read_beyond_bound<S: Storage>(storage: &S) {
        let (blob, _) = storage.open("partition", b"bound").await.unwrap();

        blob.write_at(b"test".to_vec(), 0).await.unwrap();
        let result = blob.read_at(vec![0; 8], 0).await;
        assert!(
            matches!(result, Err(Error::ReadPastEnd(_, _))),
            "reading beyond the blob should fail"
        );
    }

    /// Test writing at an offset past the end of a blob (the gap reads as zeros).
    async fn test_write_at_large_offset<S: Storage>(storage: &S) {
        let (blob, _) = storage.open("partition", b"large_offset").await.unwrap();

        blob.write_at(b"tail".to_vec(), 100).await.unwrap();
        let read = blob.read_at(vec![0xff; 104], 0).await.unwrap();
        assert!(read[..100].iter().all(|b| *b == 0));
        assert_eq!(&read[100..], b"tail");
    }

    /// Test that a resized (and synced) blob reports its new length when reopened.
    async fn test_resize_then_open<S: Storage>(storage: &S) {
        {
            let (blob, _) = storage.open("partition", b"resize").await.unwrap();
            blob.write_at(b"hello world".to_vec(), 0).await.unwrap();
            blob.resize(5).await.unwrap();
            blob.sync().await.unwrap();
        }
        let (blob, len) = storage.open("partition", b"resize").await.unwrap();
        assert_eq!(len, 5);
        let read = blob.read_at(vec![0; 5], 0).await.unwrap();
        assert_eq!(read, b"hello");

        // Growing the blob fills with zeros
        blob.resize(8).await.unwrap();
        let read = blob.read_at(vec![0xff; 8], 0).await.unwrap();
        assert_eq!(read, b"hello\0\0\0");
    }

    /// Test partition name validation.
    async fn test_partition_name_validation<S: Storage>(storage: &S) {
        for invalid in ["", "with space", "dot.ted", "slash/ed"] {
            let result = storage.open(invalid, b"blob").await;
            assert!(
                matches!(result, Err(Error::PartitionNameInvalid(_))),
                "partition {invalid:?} should be rejected"
            );
        }
        storage.open("valid_name-1", b"blob").await.unwrap();
    }

    /// Test reading zero bytes.
    async fn test_read_zero_length<S: Storage>(storage: &S) {
        let (blob, _) = storage.open("partition", b"zero_length").await.unwrap();
        let read = blob.read_at(Vec::new(), 0).await.unwrap();
        assert!(read.is_empty());
    }

    /// Clones of a handle see each other's writes before any sync.
    async fn test_clones_share_writes<S: Storage>(storage: &S) {
        let (blob, _) = storage.open("partition", b"shared").await.unwrap();
        let clone = blob.clone();
        clone.write_at(b"staged".to_vec(), 0).await.unwrap();
        let read = blob.read_at(vec![0; 6], 0).await.unwrap();
        assert_eq!(read, b"staged");
    }

    /// A blob created again after removal starts empty.
    async fn test_reopen_after_remove<S: Storage>(storage: &S) {
        let (blob, _) = storage.open("partition", b"recycled").await.unwrap();
        blob.write_at(b"old object".to_vec(), 0).await.unwrap();
        blob.sync().await.unwrap();
        storage
            .remove("partition", Some(b"recycled"))
            .await
            .unwrap();

        let (blob, len) = storage.open("partition", b"recycled").await.unwrap();
        assert_eq!(len, 0);
        let result = blob.read_at(vec![0; 1], 0).await;
        assert!(matches!(result, Err(Error::ReadPastEnd(_, _))));
    }
}
