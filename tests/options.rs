use std::path::PathBuf;

use zarrs_ome_convert::{
    Error,
    codec::Compression,
    dtype::{DtypePolicy, PixelBuffer, PixelType, check_override},
    metadata::FormatVersion,
    options::{OptionKey, OptionOverrides, SceneSelection},
};

#[test]
fn set_parses_string_values() {
    let mut o = OptionOverrides::default();
    o.set("destination", "/tmp/out").unwrap();
    o.set("level-scales", "1,1,1,1,1; 1,1,1,0.5,0.5").unwrap();
    o.set("CHUNK_SHAPE", "[1, 1, 1, 256, 0]").unwrap();
    o.set("scenes", "0,2").unwrap();
    o.set("overwrite", "yes").unwrap();
    o.set("dtype", "<u2").unwrap();
    o.set("channel_actives", "true,false").unwrap();
    o.set("format", "2").unwrap();
    o.set("compression", "bz2:5").unwrap();

    assert_eq!(o.destination, Some(PathBuf::from("/tmp/out")));
    assert_eq!(
        o.level_scales,
        Some(vec![vec![1.0; 5], vec![1.0, 1.0, 1.0, 0.5, 0.5]])
    );
    assert_eq!(o.chunk_shape, Some(vec![1, 1, 1, 256, 0]));
    assert_eq!(o.scenes, Some(SceneSelection::Indices(vec![0, 2])));
    assert_eq!(o.overwrite, Some(true));
    assert_eq!(o.dtype, Some(PixelType::Uint16));
    assert_eq!(o.channel_actives, Some(vec![true, false]));
    assert_eq!(o.format, Some(FormatVersion::V2));
    assert_eq!(o.compression, Some(Compression::Bz2 { level: 5 }));
}

#[test]
fn bad_keys_and_values() {
    let mut o = OptionOverrides::default();
    assert!(matches!(o.set("bogus", "1"), Err(Error::UnknownOption(k)) if k == "bogus"));
    assert!(matches!(o.set("tbatch", "many"), Err(Error::InvalidOption { .. })));
    assert!(o.set("overwrite", "maybe").is_err());
    assert!(o.set("scenes", "").is_err());
    assert!(o.set("dtype", "complex128").is_err());
    assert!(o.set_pair("no-equals-sign").is_err());
    o.set_pair("num_levels=3").unwrap();
    assert_eq!(o.num_levels, Some(3));
}

#[test]
fn every_key_round_trips_through_its_name() {
    for key in OptionKey::ALL {
        assert_eq!(key.name().parse::<OptionKey>().unwrap(), *key);
    }
    assert_eq!("output".parse::<OptionKey>().unwrap(), OptionKey::Destination);
}

#[test]
fn later_layers_win() {
    let base = OptionOverrides {
        destination: Some("base".into()),
        tbatch: Some(4),
        ..Default::default()
    };
    let job = OptionOverrides {
        tbatch: Some(2),
        name: Some("job".into()),
        ..Default::default()
    };
    let merged = base.merged_with(&job);
    assert_eq!(merged.destination, Some(PathBuf::from("base")));
    assert_eq!(merged.tbatch, Some(2));
    assert_eq!(merged.name.as_deref(), Some("job"));
}

#[test]
fn json_config() {
    let o: OptionOverrides = serde_json::from_str(
        r#"{
            "destination": "out",
            "scenes": [0, 1],
            "xy_scale": [0.5, 0.25],
            "format": 2,
            "compression": {"type": "gzip"},
            "dtype": "uint8"
        }"#,
    )
    .unwrap();
    assert_eq!(o.scenes, Some(SceneSelection::Indices(vec![0, 1])));
    assert_eq!(o.format, Some(FormatVersion::V2));
    assert_eq!(o.compression, Some(Compression::Gzip { level: 6 }));
    assert_eq!(o.dtype, Some(PixelType::Uint8));

    let all: OptionOverrides = serde_json::from_str(r#"{"scenes": "all"}"#).unwrap();
    assert_eq!(all.scenes, Some(SceneSelection::All));
    assert!(serde_json::from_str::<OptionOverrides>(r#"{"bogus": 1}"#).is_err());
    assert!(serde_json::from_str::<OptionOverrides>(r#"{"format": 4}"#).is_err());
}

#[test]
fn json_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("defaults.json");
    std::fs::write(&path, r#"{"num_levels": 3, "overwrite": true}"#).unwrap();
    let o = OptionOverrides::from_json_file(&path).unwrap();
    assert_eq!(o.num_levels, Some(3));
    assert_eq!(o.overwrite, Some(true));

    std::fs::write(&path, r#"{"levels": 3}"#).unwrap();
    assert!(OptionOverrides::from_json_file(&path).is_err());
}

#[test]
fn scene_selection() {
    assert_eq!(SceneSelection::All.indices(3).unwrap(), [0, 1, 2]);
    let repeated: SceneSelection = "2,0,2,1,0".parse().unwrap();
    assert_eq!(repeated.indices(3).unwrap(), [2, 0, 1]);
    assert_eq!("1, 2".parse::<SceneSelection>().unwrap().to_string(), "1,2");
    assert!(matches!(
        SceneSelection::Indices(vec![5]).indices(2),
        Err(Error::SceneOutOfRange { index: 5, count: 2 })
    ));
}

#[test]
fn compression_strings() {
    assert_eq!("raw".parse::<Compression>().unwrap(), Compression::Raw);
    assert_eq!("none".parse::<Compression>().unwrap(), Compression::Raw);
    assert_eq!("gzip".parse::<Compression>().unwrap(), Compression::Gzip { level: 6 });
    assert_eq!("bzip2".parse::<Compression>().unwrap(), Compression::Bz2 { level: 9 });
    assert_eq!(Compression::Gzip { level: 3 }.to_string(), "gzip:3");
    assert!("lz4".parse::<Compression>().is_err());
    assert!(Compression::Bz2 { level: 0 }.to_v2_compressor().is_err());
    let gzip = Compression::Gzip { level: 1 }.to_v2_compressor().unwrap().unwrap();
    assert_eq!(gzip.id(), "gzip");
    assert_eq!(
        serde_json::to_value(&gzip).unwrap(),
        serde_json::json!({"id": "gzip", "level": 1})
    );
    assert!(Compression::Raw.to_v2_compressor().unwrap().is_none());
}

#[test]
fn dtype_conversions() {
    use PixelType::*;
    assert!(Uint8.losslessly_converts_to(Uint16));
    assert!(Uint8.losslessly_converts_to(Int16));
    assert!(Uint16.losslessly_converts_to(Float32));
    assert!(!Uint16.losslessly_converts_to(Int16));
    assert!(!Int8.losslessly_converts_to(Uint64));
    assert!(!Float32.losslessly_converts_to(Int64));
    assert!(!Uint64.losslessly_converts_to(Float64));
    assert!(Float32.losslessly_converts_to(Float64));

    assert!(check_override(Uint16, Uint8, DtypePolicy::Lossless).is_err());
    assert!(check_override(Uint16, Uint8, DtypePolicy::Truncate).is_ok());
    assert!(check_override(Uint8, Uint8, DtypePolicy::Lossless).is_ok());

    let cast = PixelBuffer::Int16(vec![-5, 0, 300]).cast(Uint8);
    assert_eq!(cast, PixelBuffer::Uint8(vec![0, 0, 255]));
    let cast = PixelBuffer::Float32(vec![1.4, 1.6]).cast(Uint8);
    assert_eq!(cast, PixelBuffer::Uint8(vec![1, 2]));
}
