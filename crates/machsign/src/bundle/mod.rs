//! Batch patching and signing of app bundles.
//!
//! The [`Engine`] walks a bundle, finds every Mach-O file, and runs each one
//! through parse, patch, sign and an atomic write-back on a rayon pool. The
//! main executable (named by `CFBundleExecutable`) gets the request's
//! identifier, entitlements and dylib patches; nested binaries are re-signed
//! with their file stem as identifier.
//!
//! Bundle directories are sealed: once every nested binary is signed, the
//! bundle's files are hashed into `_CodeSignature/CodeResources`, and the
//! main executable is signed last with that plist in special slot -3. A
//! provisioning profile on the request is copied in as
//! `embedded.mobileprovision` before sealing.
//!
//! Failures are reported per file (and per slice for fat files) in the
//! returned [`FileOutcome`]s. Only identity and profile problems abort the
//! whole batch, and they do so before any file is touched.
//!
//! # Examples
//!
//! ```no_run
//! use machsign::{Engine, EngineConfig, SignRequest};
//! use std::sync::Arc;
//!
//! let engine = Engine::new(Arc::new(EngineConfig::default()))?;
//! let request = SignRequest::new("Payload/App.app")
//!     .identifier("com.example.app")
//!     .inject_dylib("@executable_path/Frameworks/TweakLoader.dylib");
//!
//! for outcome in engine.sign_bundle(&request)? {
//!     println!("{}: {}", outcome.path.display(), if outcome.is_success() { "ok" } else { "failed" });
//! }
//! # Ok::<(), machsign::Error>(())
//! ```

pub mod code_resources;
mod locks;

pub use code_resources::{seal_bundle, CodeResourcesBuilder, CODE_RESOURCES_PATH};

use crate::config::{EngineConfig, SlicePolicy};
use crate::crypto::{CertificateStatus, ProvisioningProfile, SigningIdentity, EMBEDDED_PROFILE_NAME};
use crate::macho::fat::is_macho;
use crate::macho::{sign_image, write_atomic, Image, MachOFile, PatchEffect, PatchPlan, SignatureSummary, SigningMode, SigningSettings};
use crate::{Cancellation, Error, Result};
use chrono::Utc;
use rayon::prelude::*;
use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Progress notification, sent after each file finishes.
#[derive(Debug, Clone)]
pub struct Progress {
    pub path: PathBuf,
    pub completed: usize,
    pub total: usize,
}

/// Progress callback. Called from worker threads.
pub type ProgressFn = Arc<dyn Fn(&Progress) + Send + Sync>;

/// Everything the engine needs to repackage one bundle.
#[derive(Clone, Default)]
pub struct SignRequest {
    root: PathBuf,
    identifier: Option<String>,
    entitlements: Option<Vec<u8>>,
    profile: Option<Vec<u8>>,
    identity: Option<Arc<SigningIdentity>>,
    inject: Vec<String>,
    remove: Vec<String>,
    cancellation: Cancellation,
    progress: Option<ProgressFn>,
}

impl fmt::Debug for SignRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignRequest")
            .field("root", &self.root)
            .field("identifier", &self.identifier)
            .field("entitlements", &self.entitlements.as_ref().map(Vec::len))
            .field("profile", &self.profile.as_ref().map(Vec::len))
            .field("identity", &self.identity)
            .field("inject", &self.inject)
            .field("remove", &self.remove)
            .finish_non_exhaustive()
    }
}

impl SignRequest {
    /// A request for the bundle directory (or single binary) at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    /// Code directory identifier of the main executable. Defaults to the
    /// bundle's `CFBundleIdentifier`, then to the executable's file stem.
    pub fn identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    pub fn entitlements(mut self, entitlements: Vec<u8>) -> Self {
        self.entitlements = Some(entitlements);
        self
    }

    /// Embed a `.mobileprovision` in the bundle. Its entitlements apply to
    /// the main executable unless [`SignRequest::entitlements`] is also set.
    pub fn provisioning_profile(mut self, profile: Vec<u8>) -> Self {
        self.profile = Some(profile);
        self
    }

    /// Sign with `identity` instead of ad-hoc.
    pub fn identity(mut self, identity: Arc<SigningIdentity>) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Add a load command for `path` to the main executable.
    pub fn inject_dylib(mut self, path: impl Into<String>) -> Self {
        self.inject.push(path.into());
        self
    }

    /// Remove load commands for `path` from the main executable.
    pub fn remove_dylib(mut self, path: impl Into<String>) -> Self {
        self.remove.push(path.into());
        self
    }

    pub fn cancellation(mut self, cancellation: Cancellation) -> Self {
        self.cancellation = cancellation;
        self
    }

    pub fn progress(mut self, progress: impl Fn(&Progress) + Send + Sync + 'static) -> Self {
        self.progress = Some(Arc::new(progress));
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Patch effects and signature of one successfully processed slice.
#[derive(Debug, Clone)]
pub struct SliceReport {
    pub patches: Vec<PatchEffect>,
    /// `None` when the job only patched.
    pub signature: Option<SignatureSummary>,
}

/// Result for one architecture slice.
#[derive(Debug)]
pub struct SliceOutcome {
    pub cpu_type: u32,
    pub cpu_subtype: u32,
    pub result: Result<SliceReport>,
}

/// Result for one file.
#[derive(Debug)]
pub struct FileOutcome {
    pub path: PathBuf,
    /// File-level failure (unreadable, bad fat header, cancelled), or one
    /// outcome per slice.
    pub result: Result<Vec<SliceOutcome>>,
    /// Whether the file on disk was replaced.
    pub written: bool,
}

impl FileOutcome {
    /// Every slice succeeded and the file was written.
    pub fn is_success(&self) -> bool {
        self.written
            && self
                .result
                .as_ref()
                .map_or(false, |slices| slices.iter().all(|s| s.result.is_ok()))
    }

    /// First error, file-level or slice-level.
    pub fn error(&self) -> Option<&Error> {
        match &self.result {
            Err(e) => Some(e),
            Ok(slices) => slices.iter().find_map(|s| s.result.as_ref().err()),
        }
    }
}

/// One file's worth of work.
#[derive(Debug, Clone)]
struct FileJob {
    path: PathBuf,
    plan: PatchPlan,
    signing: Option<SigningSettings>,
}

/// The jobs of one request, with the main executable held back when the
/// bundle is sealed.
#[derive(Debug)]
struct BundlePlan {
    jobs: Vec<FileJob>,
    /// Main executable job of a bundle directory, signed after sealing.
    sealed_main: Option<FileJob>,
    /// Bundle directory, for directory requests.
    bundle_root: Option<PathBuf>,
}

/// Runs patch and sign jobs under an [`EngineConfig`].
pub struct Engine {
    config: Arc<EngineConfig>,
    pool: Option<rayon::ThreadPool>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("dedicated_pool", &self.pool.is_some())
            .finish()
    }
}

impl Engine {
    /// Validate `config` and set up the worker pool.
    pub fn new(config: Arc<EngineConfig>) -> Result<Self> {
        config.validate()?;
        let pool = match config.worker_threads {
            Some(threads) => Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .thread_name(|i| format!("machsign-{}", i))
                    .build()
                    .map_err(|e| Error::Config(format!("cannot start worker pool: {}", e)))?,
            ),
            None => None,
        };
        Ok(Self { config, pool })
    }

    pub fn config(&self) -> &Arc<EngineConfig> {
        &self.config
    }

    fn install<R: Send>(&self, op: impl FnOnce() -> R + Send) -> R {
        match &self.pool {
            Some(pool) => pool.install(op),
            None => op(),
        }
    }

    /// Patch and sign every Mach-O file under the request's root.
    ///
    /// # Errors
    ///
    /// Only for batch-level problems: the identity cannot be loaded or is
    /// outside its validity window, the provisioning profile does not parse,
    /// or the bundle cannot be walked. Per-file failures, including a failure
    /// to seal the bundle's resources, are in the returned outcomes.
    pub fn sign_bundle(&self, request: &SignRequest) -> Result<Vec<FileOutcome>> {
        let identity = self.resolve_identity(request)?;
        let profile = request.profile.clone().map(ProvisioningProfile::parse).transpose()?;
        let plan = self.plan_bundle(request, profile.as_ref())?;
        let total = plan.jobs.len() + usize::from(plan.sealed_main.is_some());
        info!(root = %request.root.display(), files = total, ad_hoc = identity.is_none(), "signing bundle");

        let completed = AtomicUsize::new(0);
        let run = |job: &FileJob, outcome: &dyn Fn() -> FileOutcome| {
            let outcome = if request.cancellation.is_cancelled() {
                FileOutcome {
                    path: job.path.clone(),
                    result: Err(Error::Cancelled),
                    written: false,
                }
            } else {
                outcome()
            };
            let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
            if let Some(progress) = &request.progress {
                progress(&Progress {
                    path: job.path.clone(),
                    completed: done,
                    total,
                });
            }
            outcome
        };

        let mut outcomes = self.install(|| {
            plan.jobs
                .par_iter()
                .map(|job| run(job, &|| self.run_job(job, identity.as_deref())))
                .collect::<Vec<_>>()
        });

        if let (Some(main), Some(root)) = (&plan.sealed_main, &plan.bundle_root) {
            let outcome = run(main, &|| match seal(root, &main.path, profile.as_ref(), &request.cancellation) {
                Ok(sealed) => {
                    let mut job = main.clone();
                    job.signing = job.signing.map(|settings| settings.code_resources(sealed));
                    self.install(|| self.run_job(&job, identity.as_deref()))
                }
                Err(e) => {
                    warn!(root = %root.display(), error = %e, "sealing bundle resources failed");
                    FileOutcome {
                        path: main.path.clone(),
                        result: Err(e),
                        written: false,
                    }
                }
            });
            outcomes.push(outcome);
            outcomes.sort_by(|a, b| a.path.cmp(&b.path));
        }

        let failed = outcomes.iter().filter(|o| !o.is_success()).count();
        info!(files = total, failed, "bundle done");
        Ok(outcomes)
    }

    /// Sign one file with `settings`, ad-hoc when `identity` is `None`.
    pub fn sign_file(
        &self,
        path: impl AsRef<Path>,
        settings: SigningSettings,
        plan: PatchPlan,
        identity: Option<&SigningIdentity>,
    ) -> FileOutcome {
        let job = FileJob {
            path: path.as_ref().to_path_buf(),
            plan,
            signing: Some(settings),
        };
        self.install(|| self.run_job(&job, identity))
    }

    /// Apply `plan` to every slice of one file without re-signing.
    ///
    /// Patching invalidates an existing signature; sign afterwards to make
    /// the file loadable again.
    pub fn patch_file(&self, path: impl AsRef<Path>, plan: PatchPlan) -> FileOutcome {
        let job = FileJob {
            path: path.as_ref().to_path_buf(),
            plan,
            signing: None,
        };
        self.run_job(&job, None)
    }

    fn resolve_identity(&self, request: &SignRequest) -> Result<Option<Arc<SigningIdentity>>> {
        let identity = match (&request.identity, &self.config.identity) {
            (Some(identity), _) => identity.clone(),
            (None, Some(config)) => Arc::new(config.load()?),
            (None, None) => return Ok(None),
        };

        let report = identity.validate(Utc::now());
        let subject = identity.common_name().unwrap_or_else(|| "<unnamed>".to_string());
        match report.status {
            CertificateStatus::Valid => Ok(Some(identity)),
            CertificateStatus::Expired => Err(Error::ExpiredCertificate {
                subject,
                not_after: report.not_after,
            }),
            CertificateStatus::NotYetValid => Err(Error::BadCertificateFormat(format!(
                "certificate '{}' is not valid before {}",
                subject, report.not_before
            ))),
        }
    }

    /// Find the bundle's Mach-O files and decide what each one gets.
    fn plan_bundle(&self, request: &SignRequest, profile: Option<&ProvisioningProfile>) -> Result<BundlePlan> {
        let root = &request.root;
        let metadata = std::fs::metadata(root).map_err(|e| Error::from(e).with_path(root))?;

        let (info_plist, main_executable, bundle_identifier) = if metadata.is_dir() {
            read_bundle_info(root)?
        } else {
            (None, Some(root.clone()), None)
        };

        let binaries = if metadata.is_dir() {
            find_binaries(root)?
        } else {
            vec![root.clone()]
        };

        let entitlements = match (&request.entitlements, profile) {
            (Some(entitlements), _) => Some(entitlements.clone()),
            (None, Some(profile)) => profile.entitlements()?,
            (None, None) => None,
        };

        let mut main_plan = PatchPlan::new();
        for path in &request.remove {
            main_plan = main_plan.remove_load_dylib(path.clone());
        }
        for path in &request.inject {
            main_plan = main_plan.add_load_dylib(path.clone(), self.config.inject_weak);
        }

        let mut jobs = binaries
            .into_iter()
            .map(|path| {
                if main_executable.as_deref() == Some(path.as_path()) {
                    let identifier = request
                        .identifier
                        .clone()
                        .or_else(|| bundle_identifier.clone())
                        .unwrap_or_else(|| file_stem(&path));
                    let mut settings = self
                        .config
                        .signing_settings(identifier)
                        .cancellation(request.cancellation.clone());
                    if let Some(entitlements) = &entitlements {
                        settings = settings.entitlements(entitlements.clone());
                    }
                    if let Some(info_plist) = &info_plist {
                        settings = settings.info_plist(info_plist.clone());
                    }
                    FileJob {
                        path,
                        plan: main_plan.clone(),
                        signing: Some(settings),
                    }
                } else {
                    let settings = self
                        .config
                        .signing_settings(file_stem(&path))
                        .cancellation(request.cancellation.clone());
                    FileJob {
                        path,
                        plan: PatchPlan::new(),
                        signing: Some(settings),
                    }
                }
            })
            .collect::<Vec<_>>();

        if let Some(main) = &main_executable {
            if !jobs.iter().any(|job| job.path == *main) {
                warn!(executable = %main.display(), "CFBundleExecutable is not a Mach-O file in the bundle");
            }
        }

        let bundle_root = metadata.is_dir().then(|| root.clone());
        let sealed_main = match (&bundle_root, &main_executable) {
            (Some(_), Some(main)) => jobs
                .iter()
                .position(|job| job.path == *main)
                .map(|index| jobs.remove(index)),
            _ => None,
        };
        Ok(BundlePlan {
            jobs,
            sealed_main,
            bundle_root,
        })
    }

    /// Parse, patch, sign and write one file under its path lock.
    fn run_job(&self, job: &FileJob, identity: Option<&SigningIdentity>) -> FileOutcome {
        let lock = locks::path_lock(&job.path);
        let _guard = lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);

        match self.process_file(job, identity) {
            Ok((slices, written)) => {
                for slice in &slices {
                    if let Err(e) = &slice.result {
                        warn!(path = %job.path.display(), cpu_type = slice.cpu_type, error = %e, "slice failed");
                    }
                }
                if written {
                    info!(path = %job.path.display(), slices = slices.len(), "file written");
                }
                FileOutcome {
                    path: job.path.clone(),
                    result: Ok(slices),
                    written,
                }
            }
            Err(e) => {
                warn!(path = %job.path.display(), error = %e, "file failed");
                FileOutcome {
                    path: job.path.clone(),
                    result: Err(e.with_path(&job.path)),
                    written: false,
                }
            }
        }
    }

    fn process_file(&self, job: &FileJob, identity: Option<&SigningIdentity>) -> Result<(Vec<SliceOutcome>, bool)> {
        let file = MachOFile::open(&job.path)?;

        let mut outcomes = Vec::with_capacity(file.slices().len());
        let mut slice_data = Vec::with_capacity(file.slices().len());
        for slice in file.slices() {
            let original = file.slice_bytes(slice);
            let result = process_slice(original.to_vec(), job, identity);
            if matches!(result, Err(Error::Cancelled)) {
                return Err(Error::Cancelled);
            }
            let result = match result {
                Ok((data, report)) => {
                    slice_data.push(data);
                    Ok(report)
                }
                Err(e) => {
                    slice_data.push(original.to_vec());
                    Err(e)
                }
            };
            outcomes.push(SliceOutcome {
                cpu_type: slice.cpu_type,
                cpu_subtype: slice.cpu_subtype,
                result,
            });
        }

        let succeeded = outcomes.iter().filter(|o| o.result.is_ok()).count();
        let write = match self.config.slice_policy {
            SlicePolicy::KeepPartial => succeeded > 0,
            SlicePolicy::AllOrNothing => succeeded == outcomes.len(),
        };
        if write {
            let assembled = file.assemble(&slice_data)?;
            write_atomic(&job.path, &assembled)?;
        }
        Ok((outcomes, write))
    }
}

/// Embed `profile` in the bundle at `root`, then seal its resources.
fn seal(
    root: &Path,
    main_executable: &Path,
    profile: Option<&ProvisioningProfile>,
    cancellation: &Cancellation,
) -> Result<Vec<u8>> {
    if let Some(profile) = profile {
        let embedded = root.join(EMBEDDED_PROFILE_NAME);
        write_atomic(&embedded, profile.as_bytes())?;
        debug!(path = %embedded.display(), "embedded provisioning profile");
    }
    seal_bundle(root, main_executable, Some(cancellation))
}

fn process_slice(data: Vec<u8>, job: &FileJob, identity: Option<&SigningIdentity>) -> Result<(Vec<u8>, SliceReport)> {
    let mut image = Image::parse(data)?;
    let patches = job.plan.apply(&mut image)?;
    let signature = match &job.signing {
        Some(settings) => {
            let mode = match identity {
                Some(identity) => SigningMode::Identity(identity),
                None => SigningMode::AdHoc,
            };
            Some(sign_image(&mut image, settings, mode)?)
        }
        None => None,
    };
    debug!(
        path = %job.path.display(),
        cpu_type = image.header().cpu_type,
        patches = patches.len(),
        "processed slice"
    );
    Ok((image.into_data(), SliceReport { patches, signature }))
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unknown".to_string())
}

/// `(Info.plist bytes, main executable path, CFBundleIdentifier)` of a
/// bundle directory. A missing Info.plist yields all `None`.
fn read_bundle_info(root: &Path) -> Result<(Option<Vec<u8>>, Option<PathBuf>, Option<String>)> {
    let info_path = root.join("Info.plist");
    let bytes = match std::fs::read(&info_path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((None, None, None)),
        Err(e) => return Err(Error::from(e).with_path(&info_path)),
    };
    let info: plist::Dictionary = plist::from_bytes(&bytes).map_err(|e| Error::from(e).with_path(&info_path))?;

    let executable = info
        .get("CFBundleExecutable")
        .and_then(plist::Value::as_string)
        .map(|name| root.join(name));
    let identifier = info
        .get("CFBundleIdentifier")
        .and_then(plist::Value::as_string)
        .map(str::to_string);
    Ok((Some(bytes), executable, identifier))
}

/// Regular files under `root` that start with a Mach-O or fat magic, in
/// path order. Symlinks are not followed.
fn find_binaries(root: &Path) -> Result<Vec<PathBuf>> {
    let mut binaries = Vec::new();
    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());
            Error::from(std::io::Error::from(e)).with_path(path)
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        if has_macho_magic(entry.path())? {
            binaries.push(entry.into_path());
        }
    }
    Ok(binaries)
}

fn has_macho_magic(path: &Path) -> Result<bool> {
    let mut prefix = [0u8; 8];
    let mut file = std::fs::File::open(path).map_err(|e| Error::from(e).with_path(path))?;
    let mut read = 0;
    while read < prefix.len() {
        match file.read(&mut prefix[read..]) {
            Ok(0) => break,
            Ok(n) => read += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::from(e).with_path(path)),
        }
    }
    Ok(is_macho(&prefix[..read]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codesign::constants::{CSSLOT_INFOSLOT, CSSLOT_RESOURCEDIR};
    use crate::codesign::DigestType;
    use crate::macho::{read_entitlements, verify_image};
    use crate::test_fixtures::{fat_image, minimal_image, ImageSpec, CPU_TYPE_ARM64, CPU_TYPE_X86_64};
    use std::sync::Mutex;

    const INFO_PLIST: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0">
<dict>
    <key>CFBundleExecutable</key><string>App</string>
    <key>CFBundleIdentifier</key><string>com.example.app</string>
</dict>
</plist>"#;

    fn engine() -> Engine {
        Engine::new(Arc::new(EngineConfig::default())).unwrap()
    }

    fn bundle() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::write(root.join("Info.plist"), INFO_PLIST).unwrap();
        std::fs::write(root.join("App"), minimal_image(&ImageSpec::default())).unwrap();
        std::fs::create_dir_all(root.join("Frameworks")).unwrap();
        std::fs::write(
            root.join("Frameworks/Helper.dylib"),
            minimal_image(&ImageSpec {
                seed: 7,
                ..ImageSpec::default()
            }),
        )
        .unwrap();
        std::fs::write(root.join("readme.txt"), b"not a binary").unwrap();
        dir
    }

    fn verify_file(path: &Path) -> Vec<crate::macho::VerifyReport> {
        Image::open(path, Default::default())
            .unwrap()
            .iter()
            .map(|image| verify_image(image).unwrap())
            .collect()
    }

    #[test]
    fn test_sign_bundle_ad_hoc() {
        let dir = bundle();
        let request = SignRequest::new(dir.path()).inject_dylib("@executable_path/Frameworks/Tweak.dylib");

        let outcomes = engine().sign_bundle(&request).unwrap();

        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(FileOutcome::is_success));

        let main = verify_file(&dir.path().join("App"));
        assert_eq!(main[0].identifier(), Some("com.example.app"));
        let helper = verify_file(&dir.path().join("Frameworks/Helper.dylib"));
        assert_eq!(helper[0].identifier(), Some("Helper"));

        let app = Image::open(dir.path().join("App"), Default::default()).unwrap();
        assert!(app[0].find_dylib("@executable_path/Frameworks/Tweak.dylib").is_some());
        let helper = Image::open(dir.path().join("Frameworks/Helper.dylib"), Default::default()).unwrap();
        assert!(helper[0].find_dylib("@executable_path/Frameworks/Tweak.dylib").is_none());
    }

    #[test]
    fn test_sign_bundle_reports_progress() {
        let dir = bundle();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let request = SignRequest::new(dir.path()).progress(move |p| {
            sink.lock().unwrap().push((p.completed, p.total));
        });

        engine().sign_bundle(&request).unwrap();

        let mut seen = seen.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, vec![(1, 2), (2, 2)]);
    }

    #[test]
    fn test_cancelled_batch_leaves_files() {
        let dir = bundle();
        let before = std::fs::read(dir.path().join("App")).unwrap();
        let cancel = Cancellation::new();
        cancel.cancel();

        let outcomes = engine()
            .sign_bundle(&SignRequest::new(dir.path()).cancellation(cancel))
            .unwrap();

        assert!(outcomes.iter().all(|o| matches!(o.result, Err(Error::Cancelled)) && !o.written));
        assert_eq!(std::fs::read(dir.path().join("App")).unwrap(), before);
    }

    #[test]
    fn test_single_file_root() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tool");
        std::fs::write(&path, minimal_image(&ImageSpec::default())).unwrap();

        let outcomes = engine().sign_bundle(&SignRequest::new(&path).identifier("com.example.tool")).unwrap();

        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].is_success());
        assert_eq!(verify_file(&path)[0].identifier(), Some("com.example.tool"));
    }

    #[test]
    fn test_fat_with_corrupt_slice_keeps_partial() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fat");
        let good = minimal_image(&ImageSpec::default());
        let mut bad = minimal_image(&ImageSpec {
            cpu_type: CPU_TYPE_X86_64,
            ..ImageSpec::default()
        });
        bad[20..24].copy_from_slice(&0xffff_fff0u32.to_le_bytes());
        std::fs::write(&path, fat_image(&[(CPU_TYPE_ARM64, good), (CPU_TYPE_X86_64, bad)])).unwrap();

        let outcome = engine().sign_file(&path, SigningSettings::new("fat"), PatchPlan::new(), None);

        assert!(outcome.written);
        let slices = outcome.result.as_ref().unwrap();
        assert!(slices[0].result.is_ok());
        assert!(matches!(slices[1].result, Err(Error::CorruptBinary(_))));
        assert!(matches!(outcome.error(), Some(Error::CorruptBinary(_))));

        let file = MachOFile::open(&path).unwrap();
        let signed = Image::parse(file.slice_bytes(&file.slices()[0]).to_vec()).unwrap();
        verify_image(&signed).unwrap();
    }

    #[test]
    fn test_fat_all_or_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fat");
        let mut bad = minimal_image(&ImageSpec::default());
        bad[20..24].copy_from_slice(&0xffff_fff0u32.to_le_bytes());
        let original = fat_image(&[(CPU_TYPE_ARM64, minimal_image(&ImageSpec::default())), (CPU_TYPE_X86_64, bad)]);
        std::fs::write(&path, &original).unwrap();

        let config = EngineConfig::default().with_slice_policy(SlicePolicy::AllOrNothing);
        let engine = Engine::new(Arc::new(config)).unwrap();
        let outcome = engine.sign_file(&path, SigningSettings::new("fat"), PatchPlan::new(), None);

        assert!(!outcome.written);
        assert_eq!(std::fs::read(&path).unwrap(), original);
    }

    #[test]
    fn test_patch_file_without_signing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bin");
        std::fs::write(&path, minimal_image(&ImageSpec::default())).unwrap();

        let plan = PatchPlan::new().add_rpath("@executable_path/Frameworks");
        let outcome = engine().patch_file(&path, plan);

        assert!(outcome.is_success());
        let image = &Image::open(&path, Default::default()).unwrap()[0];
        assert_eq!(image.rpaths(), vec!["@executable_path/Frameworks"]);
        assert!(!image.has_code_signature());
    }

    #[test]
    fn test_missing_file_is_file_error() {
        let outcome = engine().patch_file("/nonexistent/machsign/bin", PatchPlan::new());
        assert!(!outcome.written);
        assert!(matches!(outcome.result, Err(Error::File { .. })));
    }

    const PROFILE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0">
<dict>
    <key>Name</key><string>Example</string>
    <key>Entitlements</key>
    <dict><key>application-identifier</key><string>ABCDE12345.com.example.app</string></dict>
</dict>
</plist>"#;

    fn sealed_resources(root: &Path) -> (Vec<u8>, plist::Dictionary) {
        let bytes = std::fs::read(root.join(CODE_RESOURCES_PATH)).unwrap();
        let dict = plist::from_bytes(&bytes).unwrap();
        (bytes, dict)
    }

    #[test]
    fn test_bundle_resources_sealed_in_main_executable() {
        let dir = bundle();
        let outcomes = engine().sign_bundle(&SignRequest::new(dir.path())).unwrap();
        assert!(outcomes.iter().all(FileOutcome::is_success));
        assert_eq!(outcomes[0].path, dir.path().join("App"));

        let (bytes, resources) = sealed_resources(dir.path());
        let main = &verify_file(&dir.path().join("App"))[0];
        main.check_special_slot(CSSLOT_RESOURCEDIR, &bytes).unwrap();
        main.check_special_slot(CSSLOT_INFOSLOT, INFO_PLIST.as_bytes()).unwrap();
        assert!(main.check_special_slot(CSSLOT_RESOURCEDIR, b"other").is_err());

        // the helper was signed before its bytes were sealed
        let helper = std::fs::read(dir.path().join("Frameworks/Helper.dylib")).unwrap();
        let files2 = resources.get("files2").and_then(plist::Value::as_dictionary).unwrap();
        let entry = files2
            .get("Frameworks/Helper.dylib")
            .and_then(plist::Value::as_dictionary)
            .unwrap();
        assert_eq!(
            entry.get("hash2").and_then(plist::Value::as_data),
            Some(DigestType::Sha256.digest(&helper).as_slice())
        );
        assert!(files2.get("App").is_none());
        assert!(files2.get("readme.txt").is_some());

        let helper_report = &verify_file(&dir.path().join("Frameworks/Helper.dylib"))[0];
        assert!(helper_report.code_directories[0].special_hash(CSSLOT_RESOURCEDIR).is_none());
    }

    #[test]
    fn test_profile_embedded_and_supplies_entitlements() {
        let dir = bundle();
        let request = SignRequest::new(dir.path()).provisioning_profile(PROFILE.as_bytes().to_vec());
        let outcomes = engine().sign_bundle(&request).unwrap();
        assert!(outcomes.iter().all(FileOutcome::is_success));

        let embedded = std::fs::read(dir.path().join(EMBEDDED_PROFILE_NAME)).unwrap();
        assert_eq!(embedded, PROFILE.as_bytes());
        let (_, resources) = sealed_resources(dir.path());
        let files2 = resources.get("files2").and_then(plist::Value::as_dictionary).unwrap();
        assert!(files2.get(EMBEDDED_PROFILE_NAME).is_some());

        let app = Image::open(dir.path().join("App"), Default::default()).unwrap();
        let entitlements = read_entitlements(&app[0]).unwrap().unwrap();
        let entitlements: plist::Dictionary = plist::from_bytes(&entitlements).unwrap();
        assert_eq!(
            entitlements.get("application-identifier").and_then(plist::Value::as_string),
            Some("ABCDE12345.com.example.app")
        );

        let helper = Image::open(dir.path().join("Frameworks/Helper.dylib"), Default::default()).unwrap();
        assert!(read_entitlements(&helper[0]).unwrap().is_none());
    }

    #[test]
    fn test_request_entitlements_win_over_profile() {
        let dir = bundle();
        let explicit = br#"<?xml version="1.0"?><plist version="1.0"><dict><key>get-task-allow</key><true/></dict></plist>"#;
        let request = SignRequest::new(dir.path())
            .provisioning_profile(PROFILE.as_bytes().to_vec())
            .entitlements(explicit.to_vec());
        engine().sign_bundle(&request).unwrap();

        let app = Image::open(dir.path().join("App"), Default::default()).unwrap();
        assert_eq!(read_entitlements(&app[0]).unwrap().unwrap(), explicit.to_vec());
    }

    #[test]
    fn test_bad_profile_aborts_batch() {
        let dir = bundle();
        let before = std::fs::read(dir.path().join("App")).unwrap();

        let request = SignRequest::new(dir.path()).provisioning_profile(b"garbage".to_vec());
        assert!(matches!(engine().sign_bundle(&request), Err(Error::Config(_))));

        assert_eq!(std::fs::read(dir.path().join("App")).unwrap(), before);
        assert!(!dir.path().join(CODE_RESOURCES_PATH).exists());
        assert!(!dir.path().join(EMBEDDED_PROFILE_NAME).exists());
    }

    #[test]
    fn test_worker_pool() {
        let engine = Engine::new(Arc::new(EngineConfig::default().with_worker_threads(2))).unwrap();
        let dir = bundle();
        let outcomes = engine.sign_bundle(&SignRequest::new(dir.path())).unwrap();
        assert!(outcomes.iter().all(FileOutcome::is_success));
    }
}
