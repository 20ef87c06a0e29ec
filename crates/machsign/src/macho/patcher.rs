//! Load command patching.
//!
//! Every operation is idempotent: applying it to an image that already has
//! the requested shape reports [`PatchEffect::AlreadySatisfied`] and leaves
//! the bytes alone. Growth of the command area is limited to the header
//! padding (see [`Image::replace_commands`]); segments are never moved.

use crate::Result;
use tracing::debug;

use super::image::Image;
use super::load_command::{CommandKind, LoadCommand};

/// Outcome of a single patch operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchEffect {
    Applied,
    AlreadySatisfied,
}

/// A single load command edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchOp {
    AddLoadDylib { path: String, weak: bool },
    RemoveLoadDylib { path: String },
    ChangeDylibPath { old: String, new: String },
    AddRPath { path: String },
    RegenerateUuid,
}

impl PatchOp {
    /// Apply to `image`.
    pub fn apply(&self, image: &mut Image) -> Result<PatchEffect> {
        match self {
            PatchOp::AddLoadDylib { path, weak } => add_load_dylib(image, path, *weak),
            PatchOp::RemoveLoadDylib { path } => remove_load_dylib(image, path),
            PatchOp::ChangeDylibPath { old, new } => change_dylib_path(image, old, new),
            PatchOp::AddRPath { path } => add_rpath(image, path),
            PatchOp::RegenerateUuid => regenerate_uuid(image),
        }
    }

    /// Whether applying this operation would leave `image` unchanged.
    pub fn is_satisfied_by(&self, image: &Image) -> bool {
        match self {
            PatchOp::AddLoadDylib { path, .. } => image.find_dylib(path).is_some(),
            PatchOp::RemoveLoadDylib { path } => image.find_dylib(path).is_none(),
            PatchOp::ChangeDylibPath { old, new } => old == new || image.find_dylib(old).is_none(),
            PatchOp::AddRPath { path } => image.rpaths().contains(&path.as_str()),
            PatchOp::RegenerateUuid => image.uuid().is_none(),
        }
    }
}

/// An ordered list of patch operations, built before anything is touched.
///
/// # Examples
///
/// ```
/// use machsign::PatchPlan;
///
/// let plan = PatchPlan::new()
///     .add_load_dylib("@executable_path/Frameworks/TweakLoader.dylib", false)
///     .add_rpath("@executable_path/Frameworks");
/// assert_eq!(plan.ops().len(), 2);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchPlan {
    ops: Vec<PatchOp>,
}

impl PatchPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, op: PatchOp) -> Self {
        self.ops.push(op);
        self
    }

    pub fn add_load_dylib(self, path: impl Into<String>, weak: bool) -> Self {
        self.push(PatchOp::AddLoadDylib {
            path: path.into(),
            weak,
        })
    }

    pub fn remove_load_dylib(self, path: impl Into<String>) -> Self {
        self.push(PatchOp::RemoveLoadDylib { path: path.into() })
    }

    pub fn change_dylib_path(self, old: impl Into<String>, new: impl Into<String>) -> Self {
        self.push(PatchOp::ChangeDylibPath {
            old: old.into(),
            new: new.into(),
        })
    }

    pub fn add_rpath(self, path: impl Into<String>) -> Self {
        self.push(PatchOp::AddRPath { path: path.into() })
    }

    pub fn regenerate_uuid(self) -> Self {
        self.push(PatchOp::RegenerateUuid)
    }

    pub fn ops(&self) -> &[PatchOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Whether the plan would leave `image` unchanged.
    ///
    /// Operations are checked against the image as it is now, so a plan whose
    /// later steps depend on earlier ones is reported as unsatisfied.
    pub fn is_satisfied_by(&self, image: &Image) -> bool {
        self.ops.iter().all(|op| op.is_satisfied_by(image))
    }

    /// Run every operation in order.
    ///
    /// All-or-nothing: if any operation fails, the image is restored to its
    /// state before the call.
    pub fn apply(&self, image: &mut Image) -> Result<Vec<PatchEffect>> {
        let snapshot = image.clone();
        let mut effects = Vec::with_capacity(self.ops.len());
        for op in &self.ops {
            match op.apply(image) {
                Ok(effect) => effects.push(effect),
                Err(e) => {
                    *image = snapshot;
                    return Err(e);
                }
            }
        }
        Ok(effects)
    }
}

/// Append an `LC_LOAD_DYLIB` (or weak) command for `path`.
pub fn add_load_dylib(image: &mut Image, path: &str, weak: bool) -> Result<PatchEffect> {
    if image.find_dylib(path).is_some() {
        return Ok(PatchEffect::AlreadySatisfied);
    }
    let mut commands = image.commands().to_vec();
    commands.push(LoadCommand::load_dylib(path, weak)?);
    image.replace_commands(commands)?;
    debug!(path, weak, "injected dylib");
    Ok(PatchEffect::Applied)
}

/// Remove every dylib command referencing `path`.
pub fn remove_load_dylib(image: &mut Image, path: &str) -> Result<PatchEffect> {
    remove_load_dylibs(image, &[path])
}

/// Remove every dylib command whose path is in `paths`.
pub fn remove_load_dylibs(image: &mut Image, paths: &[&str]) -> Result<PatchEffect> {
    let before = image.commands().len();
    let commands: Vec<LoadCommand> = image
        .commands()
        .iter()
        .filter(|c| !c.dylib_path().map_or(false, |p| paths.contains(&p)))
        .cloned()
        .collect();
    if commands.len() == before {
        return Ok(PatchEffect::AlreadySatisfied);
    }
    image.replace_commands(commands)?;
    debug!(removed = before - image.commands().len(), "removed dylibs");
    Ok(PatchEffect::Applied)
}

/// Point every dylib command referencing `old` at `new`, keeping the weak
/// flag and version fields.
pub fn change_dylib_path(image: &mut Image, old: &str, new: &str) -> Result<PatchEffect> {
    if old == new || image.find_dylib(old).is_none() {
        return Ok(PatchEffect::AlreadySatisfied);
    }
    let commands: Vec<LoadCommand> = image
        .commands()
        .iter()
        .map(|c| match c.dylib_path() {
            Some(p) if p == old => c.with_dylib_path(new),
            _ => Ok(c.clone()),
        })
        .collect::<Result<_>>()?;
    image.replace_commands(commands)?;
    debug!(old, new, "changed dylib path");
    Ok(PatchEffect::Applied)
}

/// Append an `LC_RPATH` command unless one with the same path exists.
pub fn add_rpath(image: &mut Image, path: &str) -> Result<PatchEffect> {
    if image.rpaths().contains(&path) {
        return Ok(PatchEffect::AlreadySatisfied);
    }
    let mut commands = image.commands().to_vec();
    commands.push(LoadCommand::rpath(path)?);
    image.replace_commands(commands)?;
    debug!(path, "added rpath");
    Ok(PatchEffect::Applied)
}

/// Write a fresh random UUID into `LC_UUID`.
///
/// Images without `LC_UUID` are left alone.
pub fn regenerate_uuid(image: &mut Image) -> Result<PatchEffect> {
    if image.uuid().is_none() {
        return Ok(PatchEffect::AlreadySatisfied);
    }
    let uuid = *uuid::Uuid::new_v4().as_bytes();
    let commands: Vec<LoadCommand> = image
        .commands()
        .iter()
        .map(|c| match c.kind() {
            CommandKind::Uuid(_) => c.with_uuid(uuid),
            _ => Ok(c.clone()),
        })
        .collect::<Result<_>>()?;
    image.replace_commands(commands)?;
    debug!(uuid = %uuid::Uuid::from_bytes(uuid), "regenerated uuid");
    Ok(PatchEffect::Applied)
}

/// Dylib paths referenced by the image, in load order.
pub fn list_dylibs(image: &Image) -> Vec<String> {
    image.dylibs().into_iter().map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::{minimal_image, ImageSpec};
    use crate::Error;

    const TWEAK: &str = "@executable_path/Frameworks/TweakLoader.dylib";

    fn image() -> Image {
        Image::parse(minimal_image(&ImageSpec::default())).unwrap()
    }

    #[test]
    fn test_add_load_dylib_idempotent() {
        let mut once = image();
        assert_eq!(add_load_dylib(&mut once, TWEAK, false).unwrap(), PatchEffect::Applied);

        let mut twice = once.clone();
        assert_eq!(
            add_load_dylib(&mut twice, TWEAK, false).unwrap(),
            PatchEffect::AlreadySatisfied
        );
        assert_eq!(once.data(), twice.data());
        assert_eq!(once.dylibs().last(), Some(&TWEAK));
    }

    #[test]
    fn test_add_load_dylib_no_space() {
        let spec = ImageSpec {
            padding: Some(8),
            ..ImageSpec::default()
        };
        let original = minimal_image(&spec);
        let mut image = Image::parse(original.clone()).unwrap();
        let err = add_load_dylib(&mut image, TWEAK, false).unwrap_err();
        assert!(matches!(err, Error::NoSpaceForPatch { available: 8, .. }));
        assert_eq!(image.data(), original.as_slice());
    }

    #[test]
    fn test_remove_load_dylib() {
        let mut image = image();
        add_load_dylib(&mut image, TWEAK, true).unwrap();
        assert_eq!(remove_load_dylib(&mut image, TWEAK).unwrap(), PatchEffect::Applied);
        assert!(image.find_dylib(TWEAK).is_none());
        assert_eq!(
            remove_load_dylib(&mut image, TWEAK).unwrap(),
            PatchEffect::AlreadySatisfied
        );
    }

    #[test]
    fn test_remove_restores_original_bytes() {
        let original = image();
        let mut image = original.clone();
        add_load_dylib(&mut image, TWEAK, false).unwrap();
        remove_load_dylib(&mut image, TWEAK).unwrap();
        assert_eq!(image.data(), original.data());
    }

    #[test]
    fn test_remove_load_dylibs_bulk() {
        let mut image = image();
        add_load_dylib(&mut image, "/a.dylib", false).unwrap();
        add_load_dylib(&mut image, "/b.dylib", false).unwrap();
        remove_load_dylibs(&mut image, &["/a.dylib", "/b.dylib", "/missing.dylib"]).unwrap();
        assert_eq!(list_dylibs(&image), vec!["/usr/lib/libSystem.B.dylib".to_string()]);
    }

    #[test]
    fn test_change_dylib_path() {
        let mut image = image();
        add_load_dylib(&mut image, "/old/Tweak.dylib", true).unwrap();
        let effect = change_dylib_path(&mut image, "/old/Tweak.dylib", TWEAK).unwrap();
        assert_eq!(effect, PatchEffect::Applied);
        assert!(image.find_dylib("/old/Tweak.dylib").is_none());
        assert!(matches!(
            image.find_dylib(TWEAK).map(LoadCommand::kind),
            Some(CommandKind::LoadDylib { weak: true, .. })
        ));
        assert_eq!(
            change_dylib_path(&mut image, "/old/Tweak.dylib", TWEAK).unwrap(),
            PatchEffect::AlreadySatisfied
        );
    }

    #[test]
    fn test_add_rpath_idempotent() {
        let mut image = image();
        add_rpath(&mut image, "@executable_path/Frameworks").unwrap();
        let after_first = image.data().to_vec();
        assert_eq!(
            add_rpath(&mut image, "@executable_path/Frameworks").unwrap(),
            PatchEffect::AlreadySatisfied
        );
        assert_eq!(image.data(), after_first.as_slice());
    }

    #[test]
    fn test_regenerate_uuid() {
        let mut image = image();
        let before = image.uuid().unwrap();
        let size = image.commands_size();
        regenerate_uuid(&mut image).unwrap();
        assert_ne!(image.uuid().unwrap(), before);
        assert_eq!(image.commands_size(), size);
    }

    #[test]
    fn test_plan_report_and_satisfied() {
        let plan = PatchPlan::new()
            .add_load_dylib(TWEAK, false)
            .add_rpath("@executable_path/Frameworks")
            .remove_load_dylib("/never/there.dylib");
        let mut image = image();
        assert!(!plan.is_satisfied_by(&image));

        let effects = plan.apply(&mut image).unwrap();
        assert_eq!(
            effects,
            vec![
                PatchEffect::Applied,
                PatchEffect::Applied,
                PatchEffect::AlreadySatisfied
            ]
        );
        assert!(plan.is_satisfied_by(&image));
    }

    #[test]
    fn test_plan_rolls_back_on_failure() {
        let spec = ImageSpec {
            padding: Some(48),
            ..ImageSpec::default()
        };
        let original = minimal_image(&spec);
        let mut image = Image::parse(original.clone()).unwrap();
        let plan = PatchPlan::new()
            .add_rpath("@loader_path")
            .add_load_dylib("/a/rather/long/path/to/some/injected/library.dylib", false);

        assert!(matches!(plan.apply(&mut image), Err(Error::NoSpaceForPatch { .. })));
        assert_eq!(image.data(), original.as_slice());
        assert!(image.rpaths().is_empty());
    }
}
