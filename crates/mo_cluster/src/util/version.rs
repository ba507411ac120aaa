use semver::Version;

/// Database features whose availability depends on the image version
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Capability {
    /// Query service reports running pipelines
    PipelineInfo,
    /// Sessions carry the label of the component that opened them
    SessionSource,
    /// Lock tables can move off a draining CN
    LockMigration,
    /// Shard replicas can move off a draining CN
    ShardingMigration,
}

impl Capability {
    fn since(&self) -> Version {
        match self {
            Capability::PipelineInfo => Version::new(1, 1, 0),
            Capability::SessionSource => Version::new(1, 2, 0),
            Capability::LockMigration => Version::new(1, 2, 0),
            Capability::ShardingMigration => Version::new(2, 0, 0),
        }
    }
}

/// Version of the database as told by an image reference.
///
/// Tags that are not a version (`latest`, nightly builds, digests) are
/// treated as newer than every release.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageVersion(Option<Version>);

impl ImageVersion {
    pub fn from_image(image: &str) -> Self {
        let name = image.split('@').next().unwrap_or_default();
        let last_segment = name.rsplit('/').next().unwrap_or_default();
        let tag = match last_segment.split_once(':') {
            Some((_, tag)) => tag,
            None => return ImageVersion(None),
        };
        ImageVersion(parse_tag(tag))
    }

    pub fn supports(&self, capability: Capability) -> bool {
        match &self.0 {
            None => true,
            Some(v) => Version::new(v.major, v.minor, v.patch) >= capability.since(),
        }
    }
}

fn parse_tag(tag: &str) -> Option<Version> {
    let tag = tag.strip_prefix('v').unwrap_or(tag);
    if let Ok(v) = Version::parse(tag) {
        return Some(v);
    }
    // `1.2` style tags
    let (core, _) = tag.split_once('-').unwrap_or((tag, ""));
    if core.split('.').count() == 2 {
        return Version::parse(&format!("{core}.0")).ok();
    }
    None
}
