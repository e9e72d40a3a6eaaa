mod common;

use common::{init_logging, ramp, write_npy_u16};
use zarrs_ome_convert::{
    Error,
    dtype::{PixelBuffer, PixelType},
    source::{ImageReader, MemoryReader, MemoryScene, NpyReader, open_reader, right_align},
};

#[test]
fn shapes_are_right_aligned() {
    assert_eq!(right_align(&[4, 5]).unwrap(), [1, 1, 1, 4, 5]);
    assert_eq!(right_align(&[1, 2, 3, 4, 5]).unwrap(), [1, 2, 3, 4, 5]);
    assert!(right_align(&[]).is_err());
    assert!(right_align(&[1, 1, 1, 1, 1, 1]).is_err());
}

#[test]
fn npy_three_dimensional() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stack.npy");
    let data: Vec<u16> = (0..24).collect();
    write_npy_u16(&path, &[2, 3, 4], &data);

    let reader = NpyReader::open(&path).expect("readable npy");
    assert_eq!(reader.scene_count(), 1);
    let info = reader.scene(0).unwrap();
    assert_eq!(info.shape, [1, 1, 2, 3, 4]);
    assert_eq!(info.dtype, PixelType::Uint16);
    assert_eq!(info.name.as_deref(), Some("stack"));

    let block = reader.read_time_batch(0, 0..1).unwrap();
    assert_eq!(block.shape, [1, 1, 2, 3, 4]);
    assert_eq!(block.data, PixelBuffer::Uint16(data));
    assert!(reader.read_time_batch(0, 1..2).is_err());
    assert!(matches!(
        reader.scene(1),
        Err(Error::SceneOutOfRange { index: 1, count: 1 })
    ));
}

#[test]
fn npy_time_batches_are_streamed() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("movie.npy");
    let shape = [3, 1, 1, 2, 2];
    write_npy_u16(&path, &shape, &ramp(&shape));

    let reader = open_reader(&path).expect("npy reader");
    let block = reader.read_time_batch(0, 1..3).unwrap();
    assert_eq!(block.shape, [2, 1, 1, 2, 2]);
    assert_eq!(block.data, PixelBuffer::Uint16((4..12).collect()));

    // Batches can be read in any order.
    let last = reader.read_time_batch(0, 2..3).unwrap();
    assert_eq!(last.data, PixelBuffer::Uint16((8..12).collect()));
    let first = reader.read_time_batch(0, 0..1).unwrap();
    assert_eq!(first.data, PixelBuffer::Uint16((0..4).collect()));
}

#[test]
fn unsupported_sources() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let text = dir.path().join("notes.txt");
    std::fs::write(&text, "not an image").unwrap();
    assert!(matches!(
        open_reader(&text),
        Err(Error::UnsupportedSource { .. })
    ));
    assert!(matches!(
        open_reader(&dir.path().join("missing.npy")),
        Err(Error::UnsupportedSource { .. })
    ));
}

#[test]
fn memory_reader_slices_time() {
    let shape = [4, 2, 1, 2, 2];
    let scene = MemoryScene::new(shape, ramp(&shape))
        .unwrap()
        .with_channel_names(vec!["dapi".into(), "gfp".into()])
        .with_physical_sizes([1.0, 0.2, 0.2]);
    let reader = MemoryReader::new(vec![scene]);

    let info = reader.scene(0).unwrap();
    assert_eq!(info.timepoint_len(), 8);
    assert_eq!(info.channel_names.unwrap(), ["dapi", "gfp"]);

    let block = reader.read_time_batch(0, 2..4).unwrap();
    assert_eq!(block.shape, [2, 2, 1, 2, 2]);
    assert_eq!(block.data, PixelBuffer::Uint16((16..32).collect()));
    assert!(reader.read_time_batch(0, 3..5).is_err());
}

#[test]
fn memory_scene_checks_length() {
    assert!(MemoryScene::new([1, 1, 1, 2, 2], vec![0u8; 3]).is_err());
}
