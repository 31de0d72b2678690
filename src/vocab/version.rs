use crate::prelude::*;

// The 'pep440' crate does the heavy lifting of parsing and ordering versions;
// we wrap it in our own newtype so we can hang extra methods off it and
// implement pubgrub's Version trait.

#[derive(
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Debug,
    Hash,
    SerializeDisplay,
    DeserializeFromStr,
)]
pub struct Version(pub pep440::Version);

pub static VERSION_ZERO: Lazy<Version> = Lazy::new(|| "0a0.dev0".try_into().unwrap());

pub static VERSION_INFINITY: Lazy<Version> = Lazy::new(|| {
    // Technically there is no largest PEP 440 version. But this should be good
    // enough that no-one will notice the difference...
    Version(pep440::Version {
        epoch: u32::MAX,
        release: vec![u32::MAX, u32::MAX, u32::MAX],
        pre: None,
        post: Some(u32::MAX),
        dev: None,
        local: vec![],
    })
});

impl Version {
    pub fn is_prerelease(&self) -> bool {
        self.0.pre.is_some() || self.0.dev.is_some()
    }

    pub fn has_local(&self) -> bool {
        !self.0.local.is_empty()
    }

    /// The release tuple padded (or truncated) to `n` segments.
    pub fn release_padded(&self, n: usize) -> Vec<u32> {
        let mut release = self.0.release.clone();
        release.resize(n, 0);
        release
    }

    /// Returns the smallest PEP 440 version that is strictly larger than self.
    ///
    /// The relevant ordering rules from PEP 440:
    ///
    /// - You can't attach a .postN after a .devN, so if we have a .devN the
    ///   next possible version is .dev(N+1).
    /// - You can't stack .postN suffixes, so after .postN comes .post(N+1).
    /// - Anything else can grow a .post0.dev0.
    pub fn next(&self) -> Version {
        let mut new = self.clone();
        if let Some(dev) = &mut new.0.dev {
            *dev += 1;
        } else if let Some(post) = &mut new.0.post {
            *post += 1;
        } else {
            new.0.post = Some(0);
            new.0.dev = Some(0);
        }
        new
    }

    /// The smallest version whose release tuple is strictly above ours with
    /// the leftmost non-zero segment bumped: 1.2.3 -> 2.0.0.dev0,
    /// 0.2.3 -> 0.3.0.dev0, 0.0.3 -> 0.0.4.dev0. This is the upper bound that
    /// caret requirements use.
    pub fn next_breaking(&self) -> Version {
        let mut release = self.0.release.clone();
        let bump_at = release
            .iter()
            .position(|&seg| seg != 0)
            .unwrap_or(release.len() - 1);
        release[bump_at] += 1;
        for seg in release[bump_at + 1..].iter_mut() {
            *seg = 0;
        }
        Version(pep440::Version {
            epoch: self.0.epoch,
            release,
            pre: None,
            post: None,
            dev: Some(0),
            local: vec![],
        })
    }

    /// The smallest version above every `prefix_len`-segment prefix match:
    /// for 1.2.x with prefix_len 2, that's 1.3.0.dev0. This is the upper
    /// bound for tilde and wildcard requirements.
    pub fn next_after_prefix(&self, prefix_len: usize) -> Version {
        let mut release = self.release_padded(prefix_len.max(1));
        release.truncate(prefix_len.max(1));
        *release.last_mut().unwrap() += 1;
        Version(pep440::Version {
            epoch: self.0.epoch,
            release,
            pre: None,
            post: None,
            dev: Some(0),
            local: vec![],
        })
    }
}

impl TryFrom<&str> for Version {
    type Error = eyre::Report;

    fn try_from(value: &str) -> Result<Self> {
        pep440::Version::parse(value)
            .map(Version)
            .ok_or_else(|| eyre!("failed to parse version {:?}", value))
    }
}

try_from_str_boilerplate!(Version);

impl Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl pubgrub::version::Version for Version {
    fn lowest() -> Self {
        VERSION_ZERO.to_owned()
    }

    fn bump(&self) -> Self {
        self.next()
    }
}
