//! Stream partitioning and eligibility.

use leadrun_storage::{ClientRecord, ClientStatus};

use crate::error::ConfigError;

/// Stream a client belongs to; unassigned clients run on stream 1.
pub fn effective_stream(client: &ClientRecord) -> u8 {
    client.stream.unwrap_or(1)
}

/// Active clients at or above the minimum service level.
pub fn eligible<'a, I>(clients: I, min_service_level: u8) -> Vec<ClientRecord>
where
    I: IntoIterator<Item = &'a ClientRecord>,
{
    clients
        .into_iter()
        .filter(|c| c.status == ClientStatus::Active && c.service_level >= min_service_level)
        .cloned()
        .collect()
}

/// Clients assigned to `stream`, ordered by `clientId` so retries walk
/// them in the same order.
pub fn partition(clients: Vec<ClientRecord>, stream: u8) -> Vec<ClientRecord> {
    let mut selected: Vec<ClientRecord> = clients
        .into_iter()
        .filter(|c| effective_stream(c) == stream)
        .collect();
    selected.sort_by(|a, b| a.client_id.cmp(&b.client_id));
    selected
}

pub fn validate_stream(stream: i64, max_streams: u8) -> Result<u8, ConfigError> {
    if (1..=i64::from(max_streams)).contains(&stream) {
        // In range, so it fits.
        Ok(stream as u8)
    } else {
        Err(ConfigError::StreamOutOfRange {
            stream,
            max: max_streams,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn client(id: &str, stream: Option<u8>, status: ClientStatus, level: u8) -> ClientRecord {
        ClientRecord {
            record_id: format!("rec-{}", id),
            client_id: id.to_string(),
            client_name: id.to_uppercase(),
            status,
            service_level: level,
            stream,
            email: None,
            last_lead_scoring: None,
            last_post_harvest: None,
            last_post_scoring: None,
            feature_flags: Vec::new(),
        }
    }

    #[test]
    fn unassigned_clients_default_to_stream_one() {
        let clients = vec![
            client("b", None, ClientStatus::Active, 1),
            client("a", Some(1), ClientStatus::Active, 1),
            client("c", Some(2), ClientStatus::Active, 1),
        ];
        let ids: Vec<_> = partition(clients, 1)
            .into_iter()
            .map(|c| c.client_id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn eligibility_requires_active_and_service_level() {
        let clients = vec![
            client("a", None, ClientStatus::Active, 2),
            client("b", None, ClientStatus::Inactive, 2),
            client("c", None, ClientStatus::Suspended, 3),
            client("d", None, ClientStatus::Active, 1),
        ];
        let ids: Vec<_> = eligible(&clients, 2)
            .into_iter()
            .map(|c| c.client_id)
            .collect();
        assert_eq!(ids, vec!["a"]);
    }

    #[test]
    fn stream_bounds() {
        assert_eq!(validate_stream(1, 3).unwrap(), 1);
        assert_eq!(validate_stream(3, 3).unwrap(), 3);
        assert!(validate_stream(0, 3).is_err());
        assert!(validate_stream(4, 3).is_err());
        assert!(validate_stream(300, 3).is_err());
    }

    proptest! {
        #[test]
        fn partition_is_sorted_subset_of_stream(
            specs in proptest::collection::vec(("[a-z]{1,6}", proptest::option::of(1u8..=3)), 0..20),
            stream in 1u8..=3,
        ) {
            let clients: Vec<ClientRecord> = specs
                .iter()
                .map(|(id, s)| client(id, *s, ClientStatus::Active, 1))
                .collect();
            let selected = partition(clients.clone(), stream);
            prop_assert!(selected.windows(2).all(|w| w[0].client_id <= w[1].client_id));
            prop_assert!(selected.iter().all(|c| effective_stream(c) == stream));
            let expected = clients.iter().filter(|c| effective_stream(c) == stream).count();
            prop_assert_eq!(selected.len(), expected);
        }
    }
}
