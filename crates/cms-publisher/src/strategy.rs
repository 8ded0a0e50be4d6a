//! Dispatch strategy: which of an organisation's pending records go out now.
//!
//! The dispatcher hands every locked STORED record to the strategy; whatever
//! it returns is packed and submitted, in the returned order. Records it
//! leaves out stay STORED and are reconsidered next cycle.

use cms_core::{ConsignmentRecord, OrganisationId};

pub trait DispatchStrategy: Send + Sync {
    fn select(
        &self,
        organisation_id: &OrganisationId,
        pending: Vec<ConsignmentRecord>,
    ) -> Vec<ConsignmentRecord>;
}

/// Dispatch everything as soon as it is pending.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImmediateDispatch;

impl DispatchStrategy for ImmediateDispatch {
    fn select(
        &self,
        _organisation_id: &OrganisationId,
        pending: Vec<ConsignmentRecord>,
    ) -> Vec<ConsignmentRecord> {
        pending
    }
}

impl<F> DispatchStrategy for F
where
    F: Fn(&OrganisationId, Vec<ConsignmentRecord>) -> Vec<ConsignmentRecord> + Send + Sync,
{
    fn select(
        &self,
        organisation_id: &OrganisationId,
        pending: Vec<ConsignmentRecord>,
    ) -> Vec<ConsignmentRecord> {
        self(organisation_id, pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use chrono::{TimeZone, Utc};
    use cms_core::{ConsignmentPayload, DispatchTimestamp, Organisation};

    fn pending(n: usize) -> Vec<ConsignmentRecord> {
        (0..n)
            .map(|i| {
                let payload = ConsignmentPayload {
                    sender: Organisation::new(OrganisationId::new("org-a").unwrap()),
                    receiver: Organisation::new(OrganisationId::new("org-b").unwrap()),
                    goods: BTreeMap::from([("crates".to_string(), 1)]),
                    tracking_status: None,
                    geolocation: None,
                    dispatched_at: DispatchTimestamp::parse(&format!("2024-01-01T00:00:0{i}"))
                        .unwrap(),
                };
                ConsignmentRecord::new(payload, 1, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
                    .unwrap()
            })
            .collect()
    }

    #[test]
    fn immediate_dispatch_keeps_everything_in_order() {
        let records = pending(3);
        let org = OrganisationId::new("org-a").unwrap();
        assert_eq!(ImmediateDispatch.select(&org, records.clone()), records);
    }

    #[test]
    fn closures_act_as_strategies() {
        let first_only = |_: &OrganisationId, mut pending: Vec<ConsignmentRecord>| {
            pending.truncate(1);
            pending
        };
        let org = OrganisationId::new("org-a").unwrap();
        let strategy: &dyn DispatchStrategy = &first_only;
        assert_eq!(strategy.select(&org, pending(3)).len(), 1);
    }
}
