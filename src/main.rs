//! copcbuild - builds a COPC octree container from point text files.
//!
//! Usage: copcbuild -i <FILE>... [OPTIONS]
//!
//! Options:
//!   -i <FILE>           Input point file (repeatable; bare arguments are inputs too)
//!   -o <FILE>           Output file (single input only)
//!   -odir <DIR>         Output directory
//!   -config <FILE>      JSON build config; later flags override it
//!   -depth <D>          Fixed maximum depth
//!   -root_light | -root_medium | -root_dense
//!                       Root grid 128 / 256 / 512
//!   -unordered          Eight filtered passes for spatially unordered input
//!   -tls                Terrestrial scan preset (implies -unordered)
//!   -ondisk             Spill octants to disk
//!   -max_files <N>      Open file ceiling for -ondisk (default: 1000)
//!   -tmpdir <DIR>       Where the spill directory is created
//!   -noswap | -noshuffle | -nosort
//!   -seed <N>           Shuffle and swap seed (default: 0)
//!   -scale <S>          Quantization of text coordinates (default: 0.001)
//!   -meters | -feet     Horizontal units; also accepts long/lat looking input
//!   -v | -vv            Debug / trace logging

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use log::{error, info, warn};

use copcbuild::builder::{BuildConfig, BuildReport, ClusterBuilder, RootDensity, Units};
use copcbuild::copc::ContainerSink;
use copcbuild::core::logging;
use copcbuild::core::types::Result;
use copcbuild::core::Error;
use copcbuild::octant::Backend;
use copcbuild::point::{TextOptions, TextSource};

const USAGE: &str = "usage: copcbuild -i <FILE>... [-o FILE | -odir DIR] [-config FILE] [-depth D]
       [-root_light | -root_medium | -root_dense] [-unordered | -tls]
       [-ondisk] [-max_files N] [-tmpdir DIR] [-noswap] [-noshuffle] [-nosort]
       [-seed N] [-scale S] [-meters | -feet] [-v | -vv]";

struct CliArgs {
    inputs: Vec<PathBuf>,
    output: Option<PathBuf>,
    output_dir: Option<PathBuf>,
    config: BuildConfig,
    text: TextOptions,
    log_level: &'static str,
}

fn value<'a>(args: &'a [String], i: &mut usize, flag: &str) -> Result<&'a str> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| Error::Config(format!("{} needs a value", flag)))
}

fn number<T: std::str::FromStr>(args: &[String], i: &mut usize, flag: &str) -> Result<T> {
    let raw = value(args, i, flag)?;
    raw.parse()
        .map_err(|_| Error::Config(format!("invalid value '{}' for {}", raw, flag)))
}

fn parse_args(args: &[String]) -> Result<CliArgs> {
    // -config is the base every other flag overrides, wherever it appears
    let mut config = match args.iter().position(|a| a == "-config") {
        Some(i) => {
            let path = args
                .get(i + 1)
                .ok_or_else(|| Error::Config("-config needs a value".into()))?;
            BuildConfig::load_json(Path::new(path))?
        }
        None => BuildConfig::default(),
    };

    let mut cli = CliArgs {
        inputs: Vec::new(),
        output: None,
        output_dir: None,
        config: BuildConfig::default(),
        text: TextOptions::default(),
        log_level: "info",
    };

    let mut i = 1;
    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "-i" => cli.inputs.push(PathBuf::from(value(args, &mut i, flag)?)),
            "-o" => cli.output = Some(PathBuf::from(value(args, &mut i, flag)?)),
            "-odir" => cli.output_dir = Some(PathBuf::from(value(args, &mut i, flag)?)),
            "-config" => i += 1,
            "-depth" => config.max_depth = Some(number(args, &mut i, flag)?),
            "-root_light" => config = config.with_root_density(RootDensity::Light),
            "-root_medium" => config = config.with_root_density(RootDensity::Medium),
            "-root_dense" => config = config.with_root_density(RootDensity::Dense),
            "-unordered" => config.unordered = true,
            "-tls" => config = config.tls(),
            "-ondisk" => config.backend = Backend::OnDisk,
            "-max_files" => config.max_files = number(args, &mut i, flag)?,
            "-tmpdir" => config.tmpdir = Some(PathBuf::from(value(args, &mut i, flag)?)),
            "-noswap" => config.swap = false,
            "-noshuffle" => config.shuffle = false,
            "-nosort" => config.sort = false,
            "-seed" => config.seed = number(args, &mut i, flag)?,
            "-scale" => cli.text.scale = number(args, &mut i, flag)?,
            "-meters" => config.units = Some(Units::Meters),
            "-feet" => config.units = Some(Units::Feet),
            "-v" => cli.log_level = "debug",
            "-vv" => cli.log_level = "trace",
            other if other.starts_with('-') => {
                return Err(Error::Config(format!("unknown option {}", other)));
            }
            other => cli.inputs.push(PathBuf::from(other)),
        }
        i += 1;
    }

    if cli.inputs.is_empty() {
        return Err(Error::Config("no input files".into()));
    }
    if cli.inputs.iter().any(|p| p.as_os_str() == "-") {
        return Err(Error::Config("piped input cannot be read twice".into()));
    }
    if cli.inputs.len() > 1 && config.unordered {
        return Err(Error::Config("-unordered and -tls take a single input file".into()));
    }
    if cli.inputs.len() > 1 && cli.output.is_some() {
        return Err(Error::Config("-o takes a single input file; use -odir".into()));
    }
    if !(cli.text.scale > 0.0) {
        return Err(Error::Config(format!("scale {} must be positive", cli.text.scale)));
    }
    config.validate()?;
    cli.config = config;
    Ok(cli)
}

fn output_path(input: &Path, cli: &CliArgs) -> Result<PathBuf> {
    let output = match &cli.output {
        Some(path) => path.clone(),
        None => {
            let name = input.with_extension("copc");
            let file = name.file_name().map(PathBuf::from).unwrap_or(name.clone());
            match &cli.output_dir {
                Some(dir) => dir.join(file),
                None => name,
            }
        }
    };
    if output == input {
        return Err(Error::Config(format!(
            "output {} would overwrite the input",
            output.display()
        )));
    }
    Ok(output)
}

fn build_one(input: &Path, cli: &CliArgs) -> Result<BuildReport> {
    let output = output_path(input, cli)?;
    if output.exists() {
        warn!("Overwriting {}", output.display());
    }

    let mut config = cli.config.clone();
    if config.tmpdir.is_none() {
        config.tmpdir = output
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf);
    }

    let mut source = TextSource::open(input, cli.text)?;
    let mut builder = ClusterBuilder::new(config)?;
    let (report, _) = builder.run(&mut source, |header| ContainerSink::create(&output, header))?;
    info!(
        "{} -> {}: {} points in {} chunks, depth {}",
        input.display(),
        output.display(),
        report.point_count,
        report.chunks,
        report.max_depth
    );
    Ok(report)
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 || args.iter().any(|a| a == "-h" || a == "--help") {
        println!("{}", USAGE);
        return ExitCode::SUCCESS;
    }

    let cli = match parse_args(&args) {
        Ok(cli) => cli,
        Err(e) => {
            logging::init("info");
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    logging::init(cli.log_level);

    let mut failed = 0;
    for input in &cli.inputs {
        if let Err(e) = build_one(input, &cli) {
            error!("{}: {}", input.display(), e);
            if e.aborts_batch() {
                return ExitCode::FAILURE;
            }
            failed += 1;
        }
    }

    if failed > 0 {
        error!("{} of {} inputs failed", failed, cli.inputs.len());
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
