use clap::Parser;
use zarrs_ome_convert::{Error, cli::JobArgs, metadata::FormatVersion};

#[derive(Parser)]
struct Args {
    #[command(flatten)]
    job: JobArgs,
}

fn parse(args: &[&str]) -> JobArgs {
    Args::try_parse_from(std::iter::once("prog").chain(args.iter().copied()))
        .expect("valid arguments")
        .job
}

#[test]
fn flags_become_overrides() {
    let overrides = parse(&[
        "-d",
        "out",
        "--xy-scale",
        "0.5,0.25",
        "--overwrite",
        "--format",
        "2",
        "-o",
        "tbatch=4",
        "--opt",
        "channel-names=dapi,gfp",
    ])
    .to_overrides()
    .unwrap();
    assert_eq!(overrides.destination, Some("out".into()));
    assert_eq!(overrides.xy_scale, Some(vec![0.5, 0.25]));
    assert_eq!(overrides.overwrite, Some(true));
    assert_eq!(overrides.truncate, None);
    assert_eq!(overrides.format, Some(FormatVersion::V2));
    assert_eq!(overrides.tbatch, Some(4));
    assert_eq!(
        overrides.channel_names,
        Some(vec!["dapi".to_string(), "gfp".to_string()])
    );
}

#[test]
fn bad_extra_options_are_reported() {
    let result = parse(&["-o", "colour=red"]).to_overrides();
    assert!(matches!(result, Err(Error::UnknownOption(_))));
}
