//! Identifier inspection commands.

use crate::cli::args::{InspectAction, InspectArgs};
use crate::delivery::{decompose, IdParts};
use anyhow::{anyhow, Result};
use chrono::{DateTime, SecondsFormat, Utc};

pub fn run_inspect(args: InspectArgs) -> Result<()> {
    match args.action {
        InspectAction::Id(id_args) => {
            for id in &id_args.ids {
                let parts = decompose(*id);
                let at = timestamp(&parts)?;
                if id_args.json {
                    let line = serde_json::json!({
                        "id": id,
                        "timestamp_ms": parts.timestamp_ms,
                        "timestamp": at,
                        "datacenter_id": parts.datacenter_id,
                        "machine_id": parts.machine_id,
                        "sequence": parts.sequence,
                    });
                    println!("{line}");
                } else {
                    println!(
                        "{id}: {at} datacenter={} machine={} sequence={}",
                        parts.datacenter_id, parts.machine_id, parts.sequence
                    );
                }
            }
            Ok(())
        }
    }
}

fn timestamp(parts: &IdParts) -> Result<String> {
    let millis = i64::try_from(parts.timestamp_ms)
        .map_err(|_| anyhow!("timestamp {} out of range", parts.timestamp_ms))?;
    let at = DateTime::<Utc>::from_timestamp_millis(millis)
        .ok_or_else(|| anyhow!("timestamp {millis} out of range"))?;
    Ok(at.to_rfc3339_opts(SecondsFormat::Millis, true))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::{IdGenerator, ID_EPOCH_MS};
    use crate::time::ManualClock;

    #[test]
    fn epoch_renders_as_2024() {
        let parts = decompose(0);
        assert_eq!(parts.timestamp_ms, ID_EPOCH_MS);
        assert_eq!(timestamp(&parts).unwrap(), "2024-01-01T00:00:00.000Z");
    }

    #[test]
    fn generated_id_round_trips_clock() {
        let clock = ManualClock::default();
        let ids = IdGenerator::new(clock, 3, 7).unwrap();
        let parts = decompose(ids.next_id());
        assert_eq!(timestamp(&parts).unwrap(), "2025-01-01T00:00:00.000Z");
        assert_eq!((parts.datacenter_id, parts.machine_id), (3, 7));
    }
}
