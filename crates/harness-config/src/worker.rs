use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Flavour of daemon worker the harness boots.
///
/// Both flavours run the same daemon binary; `DockerdContainerd` enables the
/// containerd image store through the daemon's feature map.
#[derive(
    Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq, Hash, EnumString, Display,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
pub enum WorkerKind {
    /// Plain daemon using its classic graph driver.
    #[default]
    Dockerd,
    /// Daemon with the containerd snapshotter enabled.
    DockerdContainerd,
}

impl WorkerKind {
    /// All known worker kinds, in registration order.
    pub const ALL: [Self; 2] = [Self::Dockerd, Self::DockerdContainerd];

    /// Whether the worker enables the containerd snapshotter feature.
    #[must_use]
    pub const fn uses_containerd_snapshotter(self) -> bool {
        matches!(self, Self::DockerdContainerd)
    }
}

/// Error returned when a [`WorkerKind`] cannot be parsed.
pub type WorkerKindParseError = strum::ParseError;

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("dockerd", WorkerKind::Dockerd)]
    #[case("dockerd-containerd", WorkerKind::DockerdContainerd)]
    #[case("Dockerd-Containerd", WorkerKind::DockerdContainerd)]
    fn parses_worker_names(#[case] input: &str, #[case] expected: WorkerKind) {
        assert_eq!(input.parse::<WorkerKind>().expect("worker parses"), expected);
    }

    #[test]
    fn displays_kebab_case_names() {
        assert_eq!(WorkerKind::DockerdContainerd.to_string(), "dockerd-containerd");
    }

    #[test]
    fn only_containerd_worker_enables_snapshotter() {
        assert!(!WorkerKind::Dockerd.uses_containerd_snapshotter());
        assert!(WorkerKind::DockerdContainerd.uses_containerd_snapshotter());
    }
}
