//! Resync requests and answers.
//!
//! A source asks agents for status; an agent asks every source for its
//! spec. The answering side lists its authoritative state for the
//! requested scope and republishes each resource with the
//! `resync_response` action.

use crate::client::{CloudEventsClient, Role};
use crate::error::ClientError;
use clustersync_core::{
    CodecError, Envelope, EventBuilder, EventType, ListOptions, ResourceObject, CLUSTER_ALL,
    EXTENSION_CLUSTER_NAME, RESYNC_RESPONSE_ACTION, SOURCE_ALL,
};

impl<T: ResourceObject> CloudEventsClient<T> {
    /// Ask the counterpart to republish its state.
    ///
    /// A source scopes the request to `options`' cluster, or every
    /// cluster. An agent always asks for its own cluster from all sources.
    ///
    /// # Errors
    ///
    /// Returns address or transport errors.
    pub async fn resync(&self, options: &ListOptions) -> Result<(), ClientError> {
        let data_type = self.shared.codec.event_data_type();
        let request = match &self.shared.role {
            Role::Source { source_id } => EventBuilder::new(
                source_id.as_str(),
                &EventType::resync_request(data_type, self.shared.role.consumes()),
            )
            .with_cluster_name(options.scope().unwrap_or(CLUSTER_ALL))
            .build(),
            Role::Agent { cluster_name } => EventBuilder::new(
                cluster_name.as_str(),
                &EventType::resync_request(data_type, self.shared.role.consumes()),
            )
            .with_cluster_name(cluster_name)
            .with_original_source(SOURCE_ALL)
            .build(),
        };

        tracing::info!(
            event_type = %request.event_type,
            scope = options.scope().unwrap_or(CLUSTER_ALL),
            "Requesting resync"
        );
        self.send(&request).await
    }

    /// Answer a resync request by republishing listed resources.
    ///
    /// Returns the number of resources republished. A request for another
    /// agent's cluster is answered with nothing.
    ///
    /// # Errors
    ///
    /// Returns a format error for a malformed request, a list error if the
    /// lister fails, or the first publish error after every listed resource
    /// has been attempted.
    pub async fn handle_resync_request(&self, request: &Envelope) -> Result<usize, ClientError> {
        let event_type = request.parsed_type().map_err(CodecError::from)?;
        self.shared.codec.check_data_type(&event_type)?;

        let role = &self.shared.role;
        if !event_type.is_resync_request() || event_type.sub_resource != role.publishes() {
            return Err(ClientError::Unexpected(format!(
                "{event_type} is not a resync request for {}",
                role.publishes()
            )));
        }

        let requested = request
            .extension_str(EXTENSION_CLUSTER_NAME)
            .filter(|name| !name.is_empty());
        let (options, reply_to) = match role {
            Role::Source { .. } => (
                requested.map_or_else(ListOptions::all, |name| ListOptions::cluster(name)),
                None,
            ),
            Role::Agent { cluster_name } => {
                if let Some(requested) = requested.filter(|name| *name != CLUSTER_ALL) {
                    if requested != cluster_name {
                        tracing::debug!(requested, "Ignoring resync request for another cluster");
                        return Ok(0);
                    }
                }
                (
                    ListOptions::cluster(cluster_name.as_str()),
                    Some(request.source.as_str()),
                )
            }
        };

        let resources = self.shared.lister.list(&options).await?;
        let response_type = EventType::new(
            self.shared.codec.event_data_type(),
            role.publishes(),
            RESYNC_RESPONSE_ACTION,
        );

        let mut published = 0;
        let mut first_error = None;
        for resource in resources.iter().filter(|resource| options.matches(*resource)) {
            // agents only answer for resources that came from the requester
            if let (Some(requester), Some(owner)) = (reply_to, resource.original_source()) {
                if requester != owner {
                    continue;
                }
            }

            match self.publish_to(&response_type, resource, reply_to).await {
                Ok(()) => published += 1,
                Err(err) => {
                    tracing::warn!(
                        error = %err,
                        resource_id = resource.resource_id(),
                        cluster_name = resource.cluster_name(),
                        "Failed to republish resource"
                    );
                    first_error.get_or_insert(err);
                }
            }
        }

        tracing::info!(
            requester = %request.source,
            scope = options.scope().unwrap_or(CLUSTER_ALL),
            published,
            "Answered resync request"
        );

        match first_error {
            Some(err) => Err(err),
            None => Ok(published),
        }
    }
}
