//! Volume identifiers.
//!
//! Copies land under `<slot>/<volume-id>/...` so that two cards with the same
//! folder layout don't collide inside one slot.

use std::path::Path;

/// Names the directory that holds a source root's copies.
pub trait VolumeIdProvider: Send + Sync {
    fn volume_id(&self, source_root: &Path) -> String;
}

/// Derives the id from the source root's display name.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisplayNameVolumeId;

impl VolumeIdProvider for DisplayNameVolumeId {
    fn volume_id(&self, source_root: &Path) -> String {
        let name = source_root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| source_root.to_string_lossy().into_owned());
        let id = sanitize_volume_name(&name);
        if id.is_empty() {
            "ROOT".to_string()
        } else {
            id
        }
    }
}

/// Always hands out the same id.
#[derive(Debug, Clone)]
pub struct FixedVolumeId(pub String);

impl VolumeIdProvider for FixedVolumeId {
    fn volume_id(&self, _source_root: &Path) -> String {
        sanitize_volume_name(&self.0)
    }
}

/// Strip characters that don't belong in a directory name.
pub fn sanitize_volume_name(name: &str) -> String {
    name.replace(['(', ')', ':'], "")
        .replace("//", "")
        .replace(['/', '\\'], "")
        .trim()
        .replace(' ', "_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_volume_name() {
        assert_eq!(sanitize_volume_name("EOS_DIGITAL (E:)"), "EOS_DIGITAL_E");
        assert_eq!(sanitize_volume_name("Untitled 2"), "Untitled_2");
        assert_eq!(sanitize_volume_name("\\\\server\\share"), "servershare");
    }

    #[test]
    fn test_display_name_provider() {
        let provider = DisplayNameVolumeId;
        assert_eq!(provider.volume_id(Path::new("/media/alice/CARD A")), "CARD_A");
        assert_eq!(provider.volume_id(Path::new("/")), "ROOT");
    }

    #[test]
    fn test_fixed_provider() {
        let provider = FixedVolumeId("Cam (B)".to_string());
        assert_eq!(provider.volume_id(Path::new("/anything")), "Cam_B");
    }
}
