#![allow(dead_code)]
use std::{path::Path, sync::Arc};

use zarrs::{array::Array, storage::store::MemoryStore};
use zarrs_ome_convert::{
    codec::Compression,
    metadata::FormatVersion,
    options::OptionOverrides,
    scale::Shape,
    storage::ZarrStore,
};

pub fn init_logging() {
    env_logger::try_init().ok();
}

/// Write a little-endian uint16 `.npy` file.
pub fn write_npy_u16(path: &Path, shape: &[u64], data: &[u16]) {
    let dims: Vec<String> = shape.iter().map(|s| s.to_string()).collect();
    let shape_str = if dims.len() == 1 {
        format!("({},)", dims[0])
    } else {
        format!("({})", dims.join(", "))
    };
    let mut header = format!("{{'descr': '<u2', 'fortran_order': False, 'shape': {shape_str}, }}");
    // magic (6) + version (2) + header length (2) + header + newline
    let unpadded = 10 + header.len() + 1;
    header.push_str(&" ".repeat((64 - unpadded % 64) % 64));
    header.push('\n');

    let mut bytes = b"\x93NUMPY\x01\x00".to_vec();
    bytes.extend_from_slice(&(header.len() as u16).to_le_bytes());
    bytes.extend_from_slice(header.as_bytes());
    for v in data {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    std::fs::write(path, bytes).expect("could not write npy file");
}

/// Ramp data in C order.
pub fn ramp(shape: &Shape) -> Vec<u16> {
    let n: u64 = shape.iter().product();
    (0..n).map(|i| i as u16).collect()
}

pub fn memory_store(format: FormatVersion) -> ZarrStore {
    ZarrStore::new(
        Arc::new(MemoryStore::new()),
        format,
        Compression::default(),
    )
}

pub fn overrides(destination: &str) -> OptionOverrides {
    OptionOverrides {
        destination: Some(destination.into()),
        ..Default::default()
    }
}

pub fn read_level_u16(store: &ZarrStore, group: &str, level: usize) -> (Vec<u64>, Vec<u16>) {
    let array = Array::open(store.storage().clone(), &format!("/{group}/{level}"))
        .expect("level should exist");
    let data = array
        .retrieve_array_subset::<Vec<u16>>(&array.subset_all())
        .expect("level should be readable");
    (array.shape().to_vec(), data)
}

pub fn group_attributes(store: &ZarrStore, key: &str) -> serde_json::Value {
    use zarrs::storage::{ReadableStorageTraits, StoreKey};
    let bytes = store
        .storage()
        .get(&StoreKey::new(key).expect("valid key"))
        .expect("readable")
        .expect("key should exist");
    serde_json::from_slice(&bytes).expect("valid JSON")
}
