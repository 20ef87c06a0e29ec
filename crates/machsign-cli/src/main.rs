//! Command-line interface for the machsign patch-and-sign engine.
//!
//! Signs app bundles and single Mach-O files (ad-hoc or with a PKCS#12
//! identity), edits dylib load commands, and inspects signatures.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use machsign::codesign::DigestType;
use machsign::macho::{read_entitlements, verify_image};
use machsign::{
    ArchFilter, Engine, EngineConfig, FileOutcome, IdentityConfig, Image, PatchEffect, PatchPlan, SignRequest, SigningIdentity,
};
use secrecy::{ExposeSecret, SecretString};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "machsign")]
#[command(about = "Patch and re-sign Mach-O binaries and app bundles")]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Sign an app bundle or a single binary
    Sign(SignArgs),
    /// Verify the embedded signature of every slice
    Verify {
        file: PathBuf,
    },
    /// Add an LC_LOAD_DYLIB (or LC_LOAD_WEAK_DYLIB) command
    Inject {
        file: PathBuf,
        dylib: String,
        /// Inject as a weak dependency
        #[arg(long)]
        weak: bool,
        #[command(flatten)]
        resign: ResignArgs,
    },
    /// Remove load commands for one or more dylibs
    Remove {
        file: PathBuf,
        #[arg(required = true)]
        dylibs: Vec<String>,
        #[command(flatten)]
        resign: ResignArgs,
    },
    /// Rewrite the path of a dylib dependency
    ChangePath {
        file: PathBuf,
        old: String,
        new: String,
        #[command(flatten)]
        resign: ResignArgs,
    },
    /// Add an LC_RPATH command
    AddRpath {
        file: PathBuf,
        rpath: String,
        #[command(flatten)]
        resign: ResignArgs,
    },
    /// List dylib dependencies and rpaths
    List {
        file: PathBuf,
    },
    /// Print the embedded entitlements
    Entitlements {
        file: PathBuf,
    },
    /// Show the certificate in a PKCS#12 file
    Identity {
        p12: PathBuf,
        #[arg(long, env = "MACHSIGN_P12_PASSWORD", default_value = "")]
        password: String,
    },
}

#[derive(Args)]
struct SignArgs {
    /// Bundle directory or Mach-O file
    path: PathBuf,

    /// Engine configuration plist
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// PKCS#12 file (.p12); ad-hoc when omitted
    #[arg(short = 'p', long)]
    pkcs12: Option<PathBuf>,

    /// Password for the PKCS#12 file
    #[arg(long, env = "MACHSIGN_P12_PASSWORD", default_value = "")]
    password: String,

    /// Code directory identifier of the main executable
    #[arg(short, long)]
    identifier: Option<String>,

    /// Entitlements plist
    #[arg(short, long)]
    entitlements: Option<PathBuf>,

    /// Provisioning profile to embed; supplies the entitlements when -e is not given
    #[arg(short = 'm', long = "profile")]
    profile: Option<PathBuf>,

    /// Dylib to inject into the main executable (repeatable)
    #[arg(short = 'l', long = "inject")]
    inject: Vec<String>,

    /// Dylib to remove from the main executable (repeatable)
    #[arg(long = "remove")]
    remove: Vec<String>,

    /// Worker threads
    #[arg(short, long)]
    jobs: Option<usize>,

    /// Only emit a SHA-256 code directory
    #[arg(long)]
    sha256_only: bool,
}

#[derive(Args)]
struct ResignArgs {
    /// Ad-hoc sign the file after patching
    #[arg(long)]
    sign: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .without_time()
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("failed to install logger")?;

    match cli.command {
        Command::Sign(args) => sign(args),
        Command::Verify { file } => verify(&file),
        Command::Inject {
            file,
            dylib,
            weak,
            resign,
        } => patch(&file, PatchPlan::new().add_load_dylib(dylib, weak), resign.sign),
        Command::Remove { file, dylibs, resign } => {
            let plan = dylibs.into_iter().fold(PatchPlan::new(), |plan, d| plan.remove_load_dylib(d));
            patch(&file, plan, resign.sign)
        }
        Command::ChangePath { file, old, new, resign } => {
            patch(&file, PatchPlan::new().change_dylib_path(old, new), resign.sign)
        }
        Command::AddRpath { file, rpath, resign } => patch(&file, PatchPlan::new().add_rpath(rpath), resign.sign),
        Command::List { file } => list(&file),
        Command::Entitlements { file } => entitlements(&file),
        Command::Identity { p12, password } => identity(&p12, SecretString::new(password)),
    }
}

fn sign(args: SignArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::from_plist_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(jobs) = args.jobs {
        config = config.with_worker_threads(jobs);
    }
    if args.sha256_only {
        config = config.with_digests(vec![DigestType::Sha256]);
    }
    if let Some(p12) = &args.pkcs12 {
        config = config.with_identity(IdentityConfig::new(p12, args.password.clone()));
    }

    let engine = Engine::new(Arc::new(config)).context("invalid configuration")?;

    let mut request = SignRequest::new(&args.path);
    if let Some(identifier) = args.identifier {
        request = request.identifier(identifier);
    }
    if let Some(path) = &args.entitlements {
        let bytes = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        request = request.entitlements(bytes);
    }
    if let Some(path) = &args.profile {
        let bytes = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        request = request.provisioning_profile(bytes);
    }
    for dylib in args.inject {
        request = request.inject_dylib(dylib);
    }
    for dylib in args.remove {
        request = request.remove_dylib(dylib);
    }

    let outcomes = engine.sign_bundle(&request)?;
    report(&outcomes)
}

fn patch(file: &Path, plan: PatchPlan, resign: bool) -> Result<()> {
    let engine = Engine::new(Arc::new(EngineConfig::default()))?;
    let outcome = if resign {
        let identifier = file
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("binary")
            .to_string();
        let settings = engine.config().signing_settings(identifier);
        engine.sign_file(file, settings, plan, None)
    } else {
        engine.patch_file(file, plan)
    };
    report(std::slice::from_ref(&outcome))
}

fn report(outcomes: &[FileOutcome]) -> Result<()> {
    let mut failed = 0;
    for outcome in outcomes {
        match &outcome.result {
            Err(e) => {
                failed += 1;
                eprintln!("FAIL {}: {}", outcome.path.display(), e);
            }
            Ok(slices) => {
                for slice in slices {
                    match &slice.result {
                        Ok(report) => {
                            let changed = report.patches.iter().filter(|p| **p == PatchEffect::Applied).count();
                            println!(
                                "ok   {} [cpu {:#x}] {} patch(es){}",
                                outcome.path.display(),
                                slice.cpu_type,
                                changed,
                                if report.signature.is_some() { ", signed" } else { "" }
                            );
                        }
                        Err(e) => {
                            failed += 1;
                            eprintln!("FAIL {} [cpu {:#x}]: {}", outcome.path.display(), slice.cpu_type, e);
                        }
                    }
                }
            }
        }
    }
    if failed > 0 {
        bail!("{} failure(s)", failed);
    }
    Ok(())
}

fn verify(file: &Path) -> Result<()> {
    let images = Image::open(file, ArchFilter::All)?;
    for image in &images {
        let report = verify_image(image).with_context(|| format!("{} failed verification", file.display()))?;
        println!("cpu {:#x}", image.header().cpu_type);
        println!("  identifier: {}", report.identifier().unwrap_or("-"));
        println!("  team id:    {}", report.team_id().unwrap_or("-"));
        println!("  ad-hoc:     {}", report.ad_hoc);
        for cdhash in &report.cdhashes {
            println!("  cdhash {:?}: {}", cdhash.digest, hex(&cdhash.hash));
        }
        for cert in &report.certificates {
            println!(
                "  certificate: {} (until {})",
                cert.subject.as_deref().unwrap_or("-"),
                cert.not_after
            );
        }
    }
    Ok(())
}

fn list(file: &Path) -> Result<()> {
    for image in Image::open(file, ArchFilter::All)? {
        println!("cpu {:#x}", image.header().cpu_type);
        for dylib in image.dylibs() {
            println!("  dylib  {}", dylib);
        }
        for rpath in image.rpaths() {
            println!("  rpath  {}", rpath);
        }
    }
    Ok(())
}

fn entitlements(file: &Path) -> Result<()> {
    let images = Image::open(file, ArchFilter::All)?;
    let Some(image) = images.first() else {
        bail!("{} has no slices", file.display());
    };
    match read_entitlements(image)? {
        Some(bytes) => println!("{}", String::from_utf8_lossy(&bytes)),
        None => println!("no entitlements"),
    }
    Ok(())
}

fn identity(p12: &Path, password: SecretString) -> Result<()> {
    let identity = SigningIdentity::from_p12_file(p12, password.expose_secret())?;
    println!("subject:    {}", identity.common_name().as_deref().unwrap_or("-"));
    println!("team id:    {}", identity.team_id().unwrap_or("-"));
    println!("not before: {}", identity.not_before());
    println!("not after:  {}", identity.not_after());
    println!("chain:      {} certificate(s)", identity.chain().len());
    Ok(())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
