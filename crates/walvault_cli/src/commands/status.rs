//! Status command implementation.

use serde::Serialize;
use walvault_agent::{resolve_position, AgentConfig, ObjectName};
use walvault_storage::ObjectInfo;

/// What the store listing says about one timeline.
#[derive(Debug, Default, PartialEq, Eq, Serialize)]
pub struct StoreSummary {
    /// Stored WAL segments on the timeline or earlier.
    pub wal_segments: usize,
    /// Complete base backups on the timeline or earlier.
    pub base_backups: usize,
    /// Base-backup parts, whether or not their backup completed.
    pub base_parts: usize,
    /// Objects whose names were not produced by the agent.
    pub foreign: usize,
    /// Total stored bytes on the timeline or earlier.
    pub bytes: u64,
    /// Where streaming would resume.
    pub resume_lsn: Option<String>,
    /// Newest complete base backup, as its object name.
    pub latest_base: Option<String>,
}

/// Summarizes a store listing for `timeline`.
pub fn summarize(listing: &[ObjectInfo], timeline: u32) -> StoreSummary {
    let mut summary = StoreSummary::default();
    for info in listing {
        let Some(name) = ObjectName::parse(&info.name) else {
            summary.foreign += 1;
            continue;
        };
        if name.timeline() > timeline {
            continue;
        }
        summary.bytes += info.size;
        match name {
            ObjectName::Wal { .. } => summary.wal_segments += 1,
            ObjectName::Base { time, .. } if time != 0 => summary.base_backups += 1,
            ObjectName::Base { .. } => {}
            ObjectName::BasePart { .. } => summary.base_parts += 1,
        }
    }

    let position = resolve_position(listing, timeline);
    summary.resume_lsn = position.wal_lsn.map(|lsn| lsn.to_string());
    summary.latest_base = position.base.map(|base| base.final_name().to_string());
    summary
}

/// Runs the status command.
pub async fn run(config: &AgentConfig, timeline: u32) -> Result<(), Box<dyn std::error::Error>> {
    let store = config.open_store().await?;
    let listing = store.list().await?;
    let summary = summarize(&listing, timeline);

    println!("Store: {}", config.store);
    println!("Timeline: {timeline}");
    println!("WAL segments: {}", summary.wal_segments);
    println!("Base backups: {}", summary.base_backups);
    println!("Base parts: {}", summary.base_parts);
    println!("Stored bytes: {}", summary.bytes);
    if summary.foreign > 0 {
        println!("Unrecognized objects: {}", summary.foreign);
    }
    match (&summary.resume_lsn, &summary.latest_base) {
        (Some(lsn), Some(base)) => {
            println!("Resumes at: {lsn}");
            println!("Latest base: {base}");
        }
        (lsn, base) => {
            println!("Resumes at: {}", lsn.as_deref().unwrap_or("-"));
            println!("Latest base: {}", base.as_deref().unwrap_or("-"));
            println!("Next run starts with a new base backup");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing(names: &[(&str, u64)]) -> Vec<ObjectInfo> {
        names
            .iter()
            .map(|(name, size)| ObjectInfo::new(*name, *size))
            .collect()
    }

    #[test]
    fn counts_objects_on_timeline() {
        let listing = listing(&[
            ("000001000000.1.wal", 100),
            ("000002000000.1.wal", 100),
            ("000003000000.2.wal", 100),
            ("000001000028.1.6000.base.part0", 40),
            ("000001000028.1.6000.base", 10),
            ("000002800000.1.7000.base.part0", 40),
            ("notes.txt", 1),
        ]);
        let summary = summarize(&listing, 1);
        assert_eq!(
            summary,
            StoreSummary {
                wal_segments: 2,
                base_backups: 1,
                base_parts: 2,
                foreign: 1,
                bytes: 290,
                resume_lsn: Some("0/3000000".into()),
                latest_base: Some("000001000028.1.6000.base".into()),
            }
        );
    }

    #[test]
    fn later_timelines_are_included_when_asked() {
        let listing = listing(&[("000001000000.1.wal", 1), ("000003000000.2.wal", 1)]);
        let summary = summarize(&listing, 2);
        assert_eq!(summary.wal_segments, 2);
        assert_eq!(summary.resume_lsn.as_deref(), Some("0/4000000"));
        assert!(summary.latest_base.is_none());
    }
}
