//! Object naming and resume-position resolution.
//!
//! The store listing is the only persistent index. Every object name
//! encodes its LSN and timeline, and base backups also carry the unix time
//! they were started at:
//!
//! | Kind | Name |
//! |---|---|
//! | WAL segment | `{lsn:012x}.{timeline:x}.wal` |
//! | Base backup | `{lsn:012x}.{timeline:x}.{time:x}.base` |
//! | Base part   | `{lsn:012x}.{timeline:x}.{time:x}.base.part{n:x}` |

use std::fmt;
use walvault_storage::ObjectInfo;
use walvault_wal::{Lsn, SEGMENT_SIZE};

/// A parsed object name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectName {
    /// One complete WAL segment.
    Wal {
        /// Segment start.
        lsn: Lsn,
        /// Timeline.
        timeline: u32,
    },
    /// The final (or only) object of a base backup.
    Base {
        /// Backup start position.
        lsn: Lsn,
        /// Timeline.
        timeline: u32,
        /// Unix time the backup started.
        time: u64,
    },
    /// A numbered part of a split base backup.
    BasePart {
        /// Backup start position.
        lsn: Lsn,
        /// Timeline.
        timeline: u32,
        /// Unix time the backup started.
        time: u64,
        /// Part index, from zero.
        part: u64,
    },
}

impl ObjectName {
    /// Parses a store object name.
    ///
    /// Returns `None` for names this agent did not produce.
    pub fn parse(name: &str) -> Option<Self> {
        let fields: Vec<&str> = name.split('.').collect();
        let lsn = Lsn(u64::from_str_radix(fields.first()?, 16).ok()?);
        let timeline = u32::from_str_radix(fields.get(1)?, 16).ok()?;
        match fields.as_slice() {
            [_, _, "wal"] => Some(Self::Wal { lsn, timeline }),
            [_, _, time, "base"] => Some(Self::Base {
                lsn,
                timeline,
                time: u64::from_str_radix(time, 16).ok()?,
            }),
            [_, _, time, "base", part] => Some(Self::BasePart {
                lsn,
                timeline,
                time: u64::from_str_radix(time, 16).ok()?,
                part: u64::from_str_radix(part.strip_prefix("part")?, 16).ok()?,
            }),
            _ => None,
        }
    }

    /// Returns the encoded LSN.
    pub fn lsn(&self) -> Lsn {
        match *self {
            Self::Wal { lsn, .. } | Self::Base { lsn, .. } | Self::BasePart { lsn, .. } => lsn,
        }
    }

    /// Returns the encoded timeline.
    pub fn timeline(&self) -> u32 {
        match *self {
            Self::Wal { timeline, .. }
            | Self::Base { timeline, .. }
            | Self::BasePart { timeline, .. } => timeline,
        }
    }
}

impl fmt::Display for ObjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Wal { lsn, timeline } => write!(f, "{:012x}.{:x}.wal", lsn.0, timeline),
            Self::Base {
                lsn,
                timeline,
                time,
            } => write!(f, "{:012x}.{:x}.{:x}.base", lsn.0, timeline, time),
            Self::BasePart {
                lsn,
                timeline,
                time,
                part,
            } => write!(
                f,
                "{:012x}.{:x}.{:x}.base.part{:x}",
                lsn.0, timeline, time, part
            ),
        }
    }
}

/// Identifies one complete base backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BaseRef {
    /// Backup start position.
    pub lsn: Lsn,
    /// Timeline.
    pub timeline: u32,
    /// Unix time the backup started.
    pub time: u64,
}

impl BaseRef {
    /// Name of the final object of this backup.
    pub fn final_name(&self) -> ObjectName {
        ObjectName::Base {
            lsn: self.lsn,
            timeline: self.timeline,
            time: self.time,
        }
    }

    /// Name of part `part` of this backup.
    pub fn part_name(&self, part: u64) -> ObjectName {
        ObjectName::BasePart {
            lsn: self.lsn,
            timeline: self.timeline,
            time: self.time,
            part,
        }
    }
}

/// Where streaming resumes, as derived from the store listing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResumePosition {
    /// End of the highest stored WAL segment.
    pub wal_lsn: Option<Lsn>,
    /// Most recent complete base backup.
    pub base: Option<BaseRef>,
}

impl ResumePosition {
    /// Returns true if streaming cannot resume without a new base backup.
    pub fn needs_new_base(&self) -> bool {
        self.wal_lsn.is_none() || self.base.is_none()
    }
}

/// Derives the resume position for `timeline` from a store listing.
///
/// Objects on later timelines and names that do not parse are ignored.
pub fn resolve_position(listing: &[ObjectInfo], timeline: u32) -> ResumePosition {
    let wal_lsn = listing
        .iter()
        .filter_map(|info| match ObjectName::parse(&info.name) {
            Some(ObjectName::Wal { lsn, timeline: tl }) if tl <= timeline => Some(lsn),
            _ => None,
        })
        .max()
        .map(|lsn| lsn + SEGMENT_SIZE);

    ResumePosition {
        wal_lsn,
        base: latest_base(listing, timeline, None),
    }
}

/// Finds the newest complete base backup on or before `timeline`.
///
/// When `max_lsn` is given, backups starting after it are skipped. A base
/// is complete once its final `.base` object exists.
pub fn latest_base(listing: &[ObjectInfo], timeline: u32, max_lsn: Option<Lsn>) -> Option<BaseRef> {
    listing
        .iter()
        .filter_map(|info| match ObjectName::parse(&info.name) {
            Some(ObjectName::Base {
                lsn,
                timeline: tl,
                time,
            }) if tl <= timeline && time != 0 && max_lsn.map_or(true, |max| lsn <= max) => {
                Some(BaseRef {
                    lsn,
                    timeline: tl,
                    time,
                })
            }
            _ => None,
        })
        .max_by_key(|base| (base.lsn, base.time))
}
