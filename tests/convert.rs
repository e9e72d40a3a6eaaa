mod common;

use std::{ops::Range, sync::Arc};

use common::{
    group_attributes, init_logging, memory_store, overrides, ramp, read_level_u16, write_npy_u16,
};
use zarrs::array::Array;
use zarrs_ome_convert::{
    Error, Result,
    convert::{CancelToken, ConversionJob, ConversionOptions, ExecutionContext, convert},
    dtype::{PixelBuffer, PixelType},
    metadata::FormatVersion,
    options::{OptionOverrides, SceneSelection},
    pyramid::downsample,
    scale::Shape,
    source::{ImageBlock, ImageReader, MemoryReader, MemoryScene, SceneInfo, ZarrReader},
    storage::StoreWriter,
};

/// Every 2x2 YX block holds one value, so 2x downsampling is exact.
fn blocky(shape: Shape) -> Vec<u16> {
    let mut out = Vec::new();
    for t in 0..shape[0] {
        for c in 0..shape[1] {
            for _z in 0..shape[2] {
                for y in 0..shape[3] {
                    for x in 0..shape[4] {
                        out.push((1000 * t + 100 * c + 4 * (y / 2) + x / 2) as u16);
                    }
                }
            }
        }
    }
    out
}

fn reader(shape: Shape) -> MemoryReader {
    MemoryReader::new(vec![MemoryScene::new(shape, blocky(shape)).unwrap()])
}

fn job(overrides: &OptionOverrides) -> ConversionJob {
    ConversionJob::new(ConversionOptions::resolve("image.ome.tiff", overrides).unwrap())
}

fn two_levels() -> OptionOverrides {
    OptionOverrides {
        num_levels: Some(2),
        ..overrides("out")
    }
}

#[test]
fn writes_every_level() {
    init_logging();
    let shape = [2, 2, 1, 8, 8];
    let store = memory_store(FormatVersion::V3);
    let report = job(&two_levels()).run_with(&reader(shape), &store).unwrap();

    assert_eq!(report.scenes.len(), 1);
    let scene = &report.scenes[0];
    assert_eq!(scene.name, "image");
    assert_eq!(scene.level_shapes, vec![[2, 2, 1, 8, 8], [2, 2, 1, 4, 4]]);
    assert_eq!(scene.batches_written, 2);
    assert_eq!(scene.timepoints, 2);
    assert!(!report.cancelled());

    let (level0_shape, level0) = read_level_u16(&store, "image.ome.zarr", 0);
    assert_eq!(level0_shape, vec![2, 2, 1, 8, 8]);
    assert_eq!(level0, blocky(shape));

    let (level1_shape, level1) = read_level_u16(&store, "image.ome.zarr", 1);
    assert_eq!(level1_shape, vec![2, 2, 1, 4, 4]);
    let expected: Vec<u16> = (0..2u16)
        .flat_map(|t| {
            (0..2u16).flat_map(move |c| (0..16u16).map(move |i| 1000 * t + 100 * c + i))
        })
        .collect();
    assert_eq!(level1, expected);

    let attrs = group_attributes(&store, "image.ome.zarr/zarr.json");
    assert_eq!(attrs["node_type"], "group");
    let multiscale = &attrs["attributes"]["ome"]["multiscales"][0];
    assert_eq!(multiscale["datasets"].as_array().unwrap().len(), 2);
    assert_eq!(multiscale["name"], "image");
    assert_eq!(
        attrs["attributes"]["ome"]["omero"]["channels"][1]["label"],
        "Channel:1"
    );
}

#[test]
fn zarr_v2_layout() {
    init_logging();
    let shape = [1, 1, 1, 8, 8];
    let store = memory_store(FormatVersion::V2);
    let overrides = OptionOverrides {
        format: Some(FormatVersion::V2),
        // Sharding is unavailable in V2 and is dropped.
        shard_factor: Some(vec![1, 1, 1, 2, 2]),
        chunk_shape: Some(vec![1, 1, 1, 4, 4]),
        ..two_levels()
    };
    let report = job(&overrides).run_with(&reader(shape), &store).unwrap();
    assert_eq!(report.scenes[0].chunk_plans[0].shard_factor, None);

    let zgroup = group_attributes(&store, "image.ome.zarr/.zgroup");
    assert_eq!(zgroup["zarr_format"], 2);
    let attrs = group_attributes(&store, "image.ome.zarr/.zattrs");
    assert_eq!(attrs["multiscales"][0]["version"], "0.4");
    let zarray = group_attributes(&store, "image.ome.zarr/0/.zarray");
    assert_eq!(zarray["zarr_format"], 2);
    assert_eq!(zarray["chunks"], serde_json::json!([1, 1, 1, 4, 4]));
    assert_eq!(zarray["dtype"], "<u2");
    assert_eq!(zarray["compressor"]["id"], "gzip");
    assert_eq!(zarray["dimension_separator"], "/");
    assert_eq!(read_level_u16(&store, "image.ome.zarr", 0).1, blocky(shape));
}

#[test]
fn sharded_levels_read_back() {
    init_logging();
    let shape = [1, 1, 1, 16, 16];
    let store = memory_store(FormatVersion::V3);
    let overrides = OptionOverrides {
        chunk_shape: Some(vec![1, 1, 1, 4, 4]),
        shard_factor: Some(vec![1, 1, 1, 2, 2]),
        ..two_levels()
    };
    let report = job(&overrides).run_with(&reader(shape), &store).unwrap();
    assert_eq!(
        report.scenes[0].chunk_plans[0].shard_factor,
        Some([1, 1, 1, 2, 2])
    );

    let array_meta = group_attributes(&store, "image.ome.zarr/0/zarr.json");
    assert!(array_meta["codecs"].to_string().contains("sharding_indexed"));
    assert_eq!(read_level_u16(&store, "image.ome.zarr", 0).1, blocky(shape));
    assert_eq!(read_level_u16(&store, "image.ome.zarr", 1).0, vec![1, 1, 1, 8, 8]);
}

#[test]
fn existing_output_requires_overwrite() {
    init_logging();
    let shape = [1, 1, 1, 4, 4];
    let store = memory_store(FormatVersion::V3);
    job(&overrides("out")).run_with(&reader(shape), &store).unwrap();
    assert!(store.exists("image").unwrap());

    let result = job(&overrides("out")).run_with(&reader(shape), &store);
    assert!(matches!(result, Err(Error::DestinationExists(_))));

    let overwrite = OptionOverrides {
        overwrite: Some(true),
        ..two_levels()
    };
    job(&overwrite).run_with(&reader(shape), &store).unwrap();
    let first = read_level_u16(&store, "image.ome.zarr", 1);
    let first_attrs = group_attributes(&store, "image.ome.zarr/zarr.json");
    job(&overwrite).run_with(&reader(shape), &store).unwrap();
    assert_eq!(read_level_u16(&store, "image.ome.zarr", 1), first);
    assert_eq!(group_attributes(&store, "image.ome.zarr/zarr.json"), first_attrs);
}

#[test]
fn scenes_get_suffixed_names() {
    init_logging();
    let shape = [1, 1, 1, 4, 4];
    let scenes = (0..3)
        .map(|i| MemoryScene::new(shape, vec![i as u8; 16]).unwrap())
        .collect();
    let reader = MemoryReader::new(scenes);
    let store = memory_store(FormatVersion::V3);

    let selected = OptionOverrides {
        scenes: Some(SceneSelection::Indices(vec![0, 2])),
        ..overrides("out")
    };
    let report = job(&selected).run_with(&reader, &store).unwrap();
    let names: Vec<&str> = report.scenes.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, ["image_0", "image_2"]);
    assert!(store.exists("image_2").unwrap());
    assert!(!store.exists("image_1").unwrap());

    let out_of_range = OptionOverrides {
        scenes: Some(SceneSelection::Indices(vec![3])),
        ..overrides("other")
    };
    assert!(matches!(
        job(&out_of_range).run_with(&reader, &store),
        Err(Error::SceneOutOfRange { index: 3, count: 3 })
    ));
}

#[test]
fn repeated_scenes_are_written_once() {
    init_logging();
    let shape = [1, 1, 1, 4, 4];
    let scenes = (0..2)
        .map(|i| MemoryScene::new(shape, vec![i as u8; 16]).unwrap())
        .collect();
    let reader = MemoryReader::new(scenes);

    let store = memory_store(FormatVersion::V3);
    let repeated = OptionOverrides {
        scenes: Some("0,1,0".parse().unwrap()),
        ..overrides("out")
    };
    let report = job(&repeated).run_with(&reader, &store).unwrap();
    let names: Vec<&str> = report.scenes.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, ["image_0", "image_1"]);

    // A single distinct scene keeps the unsuffixed name.
    let store = memory_store(FormatVersion::V3);
    let same = OptionOverrides {
        scenes: Some(SceneSelection::Indices(vec![1, 1])),
        ..overrides("out")
    };
    let report = job(&same).run_with(&reader, &store).unwrap();
    assert_eq!(report.scenes.len(), 1);
    assert_eq!(report.scenes[0].name, "image");
}

#[test]
fn scenes_run_on_a_pool() {
    init_logging();
    let shape = [1, 1, 1, 4, 4];
    let scenes = (0..4)
        .map(|i| MemoryScene::new(shape, vec![i as u16; 16]).unwrap())
        .collect();
    let reader = MemoryReader::new(scenes);
    let store = memory_store(FormatVersion::V3);
    let report = job(&overrides("out"))
        .with_context(ExecutionContext::with_workers(2).unwrap())
        .run_with(&reader, &store)
        .unwrap();
    assert_eq!(report.scenes.len(), 4);
    for (i, scene) in report.scenes.iter().enumerate() {
        assert_eq!(scene.scene, i);
        let (_, data) = read_level_u16(&store, &format!("image_{i}.ome.zarr"), 0);
        assert_eq!(data, vec![i as u16; 16]);
    }
}

#[test]
fn lossy_dtype_requires_truncation() {
    init_logging();
    let shape = [1, 1, 1, 2, 2];
    let reader = MemoryReader::new(vec![
        MemoryScene::new(shape, vec![0u16, 100, 255, 300]).unwrap(),
    ]);
    let store = memory_store(FormatVersion::V3);

    let narrowing = OptionOverrides {
        dtype: Some(PixelType::Uint8),
        ..overrides("out")
    };
    assert!(matches!(
        job(&narrowing).run_with(&reader, &store),
        Err(Error::UnsupportedDtype { .. })
    ));
    assert!(!store.exists("image").unwrap());

    let truncating = OptionOverrides {
        truncate: Some(true),
        ..narrowing
    };
    let report = job(&truncating).run_with(&reader, &store).unwrap();
    assert_eq!(report.scenes[0].dtype, PixelType::Uint8);
    let array = Array::open(store.storage().clone(), "/image.ome.zarr/0").unwrap();
    let data = array
        .retrieve_array_subset::<Vec<u8>>(&array.subset_all())
        .unwrap();
    assert_eq!(data, [0, 100, 255, 255]);
}

#[test]
fn widening_dtype_is_lossless() {
    init_logging();
    let shape = [1, 1, 1, 2, 2];
    let reader = MemoryReader::new(vec![MemoryScene::new(shape, vec![1u8, 2, 3, 4]).unwrap()]);
    let store = memory_store(FormatVersion::V3);
    let widening = OptionOverrides {
        dtype: Some(PixelType::Uint16),
        ..overrides("out")
    };
    job(&widening).run_with(&reader, &store).unwrap();
    assert_eq!(read_level_u16(&store, "image.ome.zarr", 0).1, [1, 2, 3, 4]);
}

#[test]
fn channel_overrides_are_validated() {
    init_logging();
    let shape = [1, 2, 1, 2, 2];
    let store = memory_store(FormatVersion::V3);
    let too_many = OptionOverrides {
        channel_names: Some(vec!["a".into(), "b".into(), "c".into()]),
        ..overrides("out")
    };
    let result = job(&too_many).run_with(&reader(shape), &store);
    assert!(matches!(
        result,
        Err(Error::ChannelCountMismatch {
            expected: 2,
            given: 3
        })
    ));

    let named = OptionOverrides {
        channel_names: Some(vec!["dapi".into(), "gfp".into()]),
        channel_colors: Some(vec!["blue".into(), "#00ff00".into()]),
        ..overrides("out")
    };
    job(&named).run_with(&reader(shape), &store).unwrap();
    let attrs = group_attributes(&store, "image.ome.zarr/zarr.json");
    let channels = &attrs["attributes"]["ome"]["omero"]["channels"];
    assert_eq!(channels[0]["label"], "dapi");
    assert_eq!(channels[0]["color"], "0000FF");
    assert_eq!(channels[1]["color"], "00FF00");
}

/// Reader which cancels `token` once the first batch has been read.
struct CancellingReader {
    inner: MemoryReader,
    token: CancelToken,
}

impl ImageReader for CancellingReader {
    fn scene_count(&self) -> usize {
        self.inner.scene_count()
    }

    fn scene(&self, index: usize) -> Result<SceneInfo> {
        self.inner.scene(index)
    }

    fn read_time_batch(&self, scene: usize, time: Range<u64>) -> Result<ImageBlock> {
        self.token.cancel();
        self.inner.read_time_batch(scene, time)
    }
}

#[test]
fn cancellation_keeps_completed_batches() {
    init_logging();
    let shape = [4, 1, 1, 4, 4];
    let token = CancelToken::new();
    let reader = CancellingReader {
        inner: reader(shape),
        token: token.clone(),
    };
    let store = memory_store(FormatVersion::V3);
    let report = job(&two_levels())
        .with_cancel(token)
        .run_with(&reader, &store)
        .unwrap();

    assert!(report.cancelled());
    assert_eq!(report.scenes[0].timepoints, 1);
    assert_eq!(report.scenes[0].level_shapes[1], [1, 1, 1, 2, 2]);
    let (level0_shape, level0) = read_level_u16(&store, "image.ome.zarr", 0);
    assert_eq!(level0_shape, vec![1, 1, 1, 4, 4]);
    assert_eq!(level0, blocky([1, 1, 1, 4, 4]));
    let attrs = group_attributes(&store, "image.ome.zarr/zarr.json");
    assert!(attrs["attributes"]["ome"]["multiscales"].is_array());
}

/// Reader whose second batch fails.
struct FailingReader(MemoryReader);

impl ImageReader for FailingReader {
    fn scene_count(&self) -> usize {
        self.0.scene_count()
    }

    fn scene(&self, index: usize) -> Result<SceneInfo> {
        self.0.scene(index)
    }

    fn read_time_batch(&self, scene: usize, time: Range<u64>) -> Result<ImageBlock> {
        if time.start >= 1 {
            return Err(Error::general("disk on fire"));
        }
        self.0.read_time_batch(scene, time)
    }
}

#[test]
fn failures_carry_scene_and_batch() {
    init_logging();
    let store = memory_store(FormatVersion::V3);
    let result = job(&overrides("out")).run_with(&FailingReader(reader([3, 1, 1, 2, 2])), &store);
    match result {
        Err(Error::Conversion {
            scene,
            batch: Some(batch),
            source,
        }) => {
            assert_eq!(scene, 0);
            assert_eq!(batch.index, 1);
            assert_eq!(batch.time, 1..2);
            assert!(source.to_string().contains("disk on fire"));
        }
        other => panic!("expected a conversion error, got {other:?}"),
    }
}

#[test]
fn downsample_averages_partial_windows() {
    let block = ImageBlock::new([1, 1, 1, 1, 3], PixelBuffer::Uint8(vec![1, 2, 6])).unwrap();
    let out = downsample(&block, &[1, 1, 1, 1, 2]);
    assert_eq!(out.shape, [1, 1, 1, 1, 2]);
    assert_eq!(out.data, PixelBuffer::Uint8(vec![2, 6]));

    let block =
        ImageBlock::new([1, 1, 1, 1, 3], PixelBuffer::Float32(vec![1.0, 2.0, 6.0])).unwrap();
    let out = downsample(&block, &[1, 1, 1, 1, 2]);
    assert_eq!(out.data, PixelBuffer::Float32(vec![1.5, 6.0]));

    let block = ImageBlock::new([1, 1, 2, 2, 2], PixelBuffer::Int16((-4..4).collect())).unwrap();
    let out = downsample(&block, &[1, 1, 2, 2, 2]);
    assert_eq!(out.shape, [1, 1, 1, 1, 1]);
    assert_eq!(out.data, PixelBuffer::Int16(vec![-1]));
}

#[test]
fn downsample_is_exact_for_wide_integers() {
    let big = 1u64 << 60;
    let data = PixelBuffer::Uint64(vec![big + 1, big + 2, u64::MAX, u64::MAX]);
    let block = ImageBlock::new([1, 1, 1, 1, 4], data).unwrap();
    let out = downsample(&block, &[1, 1, 1, 1, 2]);
    assert_eq!(out.data, PixelBuffer::Uint64(vec![big + 2, u64::MAX]));

    // Halves round away from zero.
    let low = i64::MIN + 1;
    let block = ImageBlock::new([1, 1, 1, 1, 2], PixelBuffer::Int64(vec![low, low + 1])).unwrap();
    let out = downsample(&block, &[1, 1, 1, 1, 2]);
    assert_eq!(out.data, PixelBuffer::Int64(vec![low]));
}

#[test]
fn options_are_validated_before_io() {
    let cases = [
        (OptionOverrides::default(), "destination"),
        (
            OptionOverrides {
                tbatch: Some(0),
                ..overrides("out")
            },
            "tbatch",
        ),
        (
            OptionOverrides {
                name: Some("a/b".into()),
                ..overrides("out")
            },
            "name",
        ),
        (
            OptionOverrides {
                shard_factor: Some(vec![1, 1, 1, 2, 2]),
                shard_memory_target: Some(1024),
                ..overrides("out")
            },
            "shard",
        ),
        (
            OptionOverrides {
                chunk_shape: Some(vec![1, 2]),
                ..overrides("out")
            },
            "chunk_shape",
        ),
        (
            OptionOverrides {
                num_levels: Some(2),
                xy_scale: Some(vec![0.5]),
                ..overrides("out")
            },
            "scale",
        ),
        (
            OptionOverrides {
                physical_pixel_sizes: Some(vec![1.0, -1.0, 1.0]),
                ..overrides("out")
            },
            "physical_pixel_sizes",
        ),
    ];
    for (overrides, case) in cases {
        let err = ConversionOptions::resolve("image.npy", &overrides)
            .expect_err(&format!("{case} should be rejected"));
        assert!(err.is_validation(), "{case}: {err}");
    }
}

#[test]
fn default_names() {
    let options = ConversionOptions::resolve("/data/cells.ome.tiff", &overrides("out")).unwrap();
    assert_eq!(options.name, "cells");
    assert_eq!(options.output_path(0, false), std::path::Path::new("out/cells.ome.zarr"));
    assert_eq!(options.output_name(1, true), "cells_1");
    let options = ConversionOptions::resolve("/data/stack.npy", &overrides("out")).unwrap();
    assert_eq!(options.name, "stack");
}

#[test]
fn filesystem_round_trip() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("movie.npy");
    let shape = [2, 1, 3, 8, 8];
    write_npy_u16(&source, &shape, &ramp(&shape));

    let destination = dir.path().join("out");
    let overrides = OptionOverrides {
        destination: Some(destination.clone()),
        xy_scale: Some(vec![0.5]),
        physical_pixel_sizes: Some(vec![2.0, 0.25, 0.25]),
        channel_names: Some(vec!["membrane".into()]),
        tbatch: Some(2),
        ..Default::default()
    };
    let report = convert(&source, &overrides).unwrap();
    assert_eq!(report.scenes[0].batches_written, 1);

    let group = destination.join("movie.ome.zarr");
    assert!(group.join("zarr.json").is_file());
    assert!(group.join("1").join("zarr.json").is_file());

    let reread = ZarrReader::open(&group).expect("output is a readable zarr");
    let info = reread.scene(0).unwrap();
    assert_eq!(info.shape, shape);
    assert_eq!(info.channel_names.as_deref(), Some(&["membrane".to_string()][..]));
    assert_eq!(info.physical_sizes, Some([2.0, 0.25, 0.25]));
    let block = reread.read_time_batch(0, 0..2).unwrap();
    assert_eq!(block.data, PixelBuffer::Uint16(ramp(&shape)));
}

#[test]
fn stores_can_be_shared() {
    let store = memory_store(FormatVersion::V3);
    let shared: Arc<dyn StoreWriter> = Arc::new(store.clone());
    assert!(!shared.exists("image").unwrap());
    job(&overrides("out")).run_with(&reader([1, 1, 1, 2, 2]), shared.as_ref()).unwrap();
    assert!(store.exists("image").unwrap());
}
