//! Controller configuration read from the environment

/// Default rsync mover image
pub const DEFAULT_RSYNC_IMAGE: &str = "quay.io/backube/scribe-mover-rsync:latest";
/// Default rclone mover image
pub const DEFAULT_RCLONE_IMAGE: &str = "quay.io/backube/scribe-mover-rclone:latest";
/// Default restic mover image
pub const DEFAULT_RESTIC_IMAGE: &str = "quay.io/backube/scribe-mover-restic:latest";

/// Container images the mover jobs run
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MoverImages {
    /// Image for rsync jobs
    pub rsync: String,
    /// Image for rclone jobs
    pub rclone: String,
    /// Image for restic jobs
    pub restic: String,
}

impl Default for MoverImages {
    fn default() -> Self {
        Self {
            rsync: DEFAULT_RSYNC_IMAGE.to_string(),
            rclone: DEFAULT_RCLONE_IMAGE.to_string(),
            restic: DEFAULT_RESTIC_IMAGE.to_string(),
        }
    }
}

impl MoverImages {
    /// Read `RSYNC_CONTAINER_IMAGE`, `RCLONE_CONTAINER_IMAGE` and
    /// `RESTIC_CONTAINER_IMAGE`, falling back to the published images
    pub fn from_env() -> Self {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let image = |var: &str, default: &str| {
            lookup(var)
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| default.to_string())
        };
        Self {
            rsync: image("RSYNC_CONTAINER_IMAGE", DEFAULT_RSYNC_IMAGE),
            rclone: image("RCLONE_CONTAINER_IMAGE", DEFAULT_RCLONE_IMAGE),
            restic: image("RESTIC_CONTAINER_IMAGE", DEFAULT_RESTIC_IMAGE),
        }
    }
}
