use edge_flags::{Asset, AssetSource, Error, KeyValueStore, Result};
use fastly::kv_store::KVStoreError;
use fastly::KVStore;

pub const VISITOR_CACHE_STORE: &str = "visitor_cache";
pub const ASSET_STORE: &str = "static_assets";

/// [`KeyValueStore`] over a Fastly KV Store, opened by name on each operation.
#[derive(Debug, Clone)]
pub struct FastlyKvStore {
    name: String,
}

impl FastlyKvStore {
    pub fn new(name: impl Into<String>) -> Self {
        FastlyKvStore { name: name.into() }
    }

    fn open(&self) -> Result<KVStore> {
        let name = &self.name;
        match KVStore::open(name) {
            Ok(Some(store)) => Ok(store),
            Ok(None) => Err(Error::Store(format!("KV store {name} does not exist"))),
            Err(e) => Err(self.error(e)),
        }
    }

    fn error(&self, e: KVStoreError) -> Error {
        Error::Store(format!("KV store {}: {:?}", self.name, e))
    }
}

impl KeyValueStore for FastlyKvStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.open()?.lookup(key) {
            Ok(mut item) => Ok(Some(item.take_body().into_bytes())),
            Err(KVStoreError::ItemNotFound) => Ok(None),
            Err(e) => Err(self.error(e)),
        }
    }

    fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.open()?.insert(key, value).map_err(|e| self.error(e))
    }

    fn delete(&self, key: &str) -> Result<()> {
        match self.open()?.delete(key) {
            Ok(()) | Err(KVStoreError::ItemNotFound) => Ok(()),
            Err(e) => Err(self.error(e)),
        }
    }
}

/// Static files uploaded to a KV Store, keyed by path without the leading `/`.
#[derive(Debug, Clone)]
pub struct KvAssetSource {
    store: FastlyKvStore,
}

impl KvAssetSource {
    pub fn new(name: impl Into<String>) -> Self {
        KvAssetSource {
            store: FastlyKvStore::new(name),
        }
    }
}

impl AssetSource for KvAssetSource {
    fn fetch(&self, path: &str) -> Result<Option<Asset>> {
        Ok(self.store.get(path)?.map(|body| Asset::new(path, body)))
    }
}
