//! Bus scan: find out which module ids answer and what they are.

use crate::connection::{Connection, DispatchMode};
use crate::error::CtlabResult;
use crate::module::{Identity, Module, IDENTITY_CHANNEL};
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Ids scanned when the caller has no better idea.
pub const DEFAULT_SCAN_RANGE: RangeInclusive<u8> = 0..=15;

/// Time given to the modules to answer.
pub const DEFAULT_SETTLE: Duration = Duration::from_secs(1);

/// Ask every id in `ids` for its identity and report the ones that answered.
///
/// Ids without a registered module get a temporary generic one, removed again
/// before returning. Waits `settle`, then (in polling mode) reads everything
/// that arrived. In event-driven mode the background task has already
/// dispatched the answers.
///
/// Results are ordered like `ids`.
pub async fn identify_modules(
    connection: &Arc<Connection>,
    ids: impl IntoIterator<Item = u8>,
    settle: Duration,
) -> CtlabResult<Vec<(u8, Identity)>> {
    let mut candidates = Vec::new();
    let mut temporary = Vec::new();

    for id in ids {
        let module = match connection.registry().get(id) {
            Some(core) => Module::from_core(core, Arc::clone(connection)),
            None => {
                temporary.push(id);
                Module::new(id, connection)?
            }
        };
        candidates.push(module);
    }

    let result = scan(connection, &candidates, settle).await;

    for id in &temporary {
        connection.registry().remove(*id);
    }
    debug!(removed = temporary.len(), "Removed temporary scan modules");

    result
}

async fn scan(
    connection: &Connection,
    candidates: &[Module],
    settle: Duration,
) -> CtlabResult<Vec<(u8, Identity)>> {
    for module in candidates {
        module.req_identity().await?;
    }

    tokio::time::sleep(settle).await;
    if connection.mode() == DispatchMode::Polling {
        connection.drain().await?;
    }

    let mut found = Vec::new();
    for module in candidates {
        if !module.is_fresh(IDENTITY_CHANNEL) {
            continue;
        }
        if let Ok(identity) = module.identity() {
            info!(module = module.id(), identity = %identity, "Module answered");
            found.push((module.id(), identity));
        }
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionOptions;
    use crate::mock_stream;
    use crate::profiles::RegulatedSource;

    #[tokio::test]
    async fn reports_answering_modules_and_cleans_up() {
        let (connector, mut harness) = mock_stream::connector();
        let connection = Connection::new(connector, ConnectionOptions::default());
        connection.connect().await.unwrap();
        let dcg = RegulatedSource::new(2, &connection).unwrap();

        let scan = {
            let connection = Arc::clone(&connection);
            tokio::spawn(async move {
                identify_modules(&connection, 1..=3, Duration::from_millis(200)).await
            })
        };

        harness.expect_write(b"1:254?\r\n2:254?\r\n3:254?\r\n").await;
        harness
            .send_response(b"#2:254=3.1 [DCG]\r\n#3:254=1.0 [EDL]\r\n")
            .unwrap();

        let found = scan.await.unwrap().unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].0, 2);
        assert_eq!(found[0].1.name.as_deref(), Some("DCG"));
        assert_eq!(found[1].1.firmware, "1.0");

        // Only the pre-registered module survives the scan
        assert_eq!(connection.registry().ids(), vec![2]);
        assert_eq!(dcg.identity().unwrap().firmware, "3.1");
    }
}
