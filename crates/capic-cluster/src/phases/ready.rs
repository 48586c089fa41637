//! Ready phase handler
//!
//! Periodic resync: re-reads the credentials and checks them against the
//! cloud so a rotated or revoked Secret shows up as a condition.

use tracing::{debug, warn};

use capic_common::crd::{
    condition_types, Condition, ConditionStatus, IonosCloudCluster, IonosCloudClusterStatus,
};
use capic_common::kube_utils::resource_name;
use capic_common::{Error, ErrorClass, Outcome};

use super::{cloud_client, waiting_for_credentials};
use crate::controller::Context;

/// Handle a cluster in the Ready phase
///
/// Ready is never left for drift in credentials: the problem is reported
/// through the CredentialsResolved condition and checked again sooner.
pub async fn handle_ready(
    cluster: &IonosCloudCluster,
    ctx: &Context,
) -> Result<Outcome<IonosCloudClusterStatus>, Error> {
    let current = cluster.status.clone().unwrap_or_default();

    let Some(cloud) = cloud_client(cluster, ctx).await? else {
        warn!("credentials Secret disappeared from a Ready cluster");
        return Ok(waiting_for_credentials(cluster, current, ctx));
    };

    match cloud.verify_location(&cluster.spec.location).await {
        Ok(()) => {
            debug!("credentials still valid");
            let next = current.condition(Condition::new(
                condition_types::CREDENTIALS_RESOLVED,
                ConditionStatus::True,
                "Resolved",
                "",
            ));
            Ok(Outcome::requeue(ctx.config.ready_resync).with_status(next))
        }
        Err(e) if e.class == ErrorClass::Transient => {
            Err(e.into_error(&resource_name(cluster), "verify_location"))
        }
        Err(e) => {
            warn!(error = %e, "credentials rejected during resync");
            let next = current.condition(Condition::new(
                condition_types::CREDENTIALS_RESOLVED,
                ConditionStatus::False,
                "Rejected",
                e.message,
            ));
            Ok(Outcome::requeue(ctx.config.waiting_interval).with_status(next))
        }
    }
}
