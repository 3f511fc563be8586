//! OPC UA client transport (feature `opcua`).
//!
//! Connects anonymously with security policy `None`, the way the gantry
//! PLC is provisioned.  The `opcua` client API is blocking and runs its own
//! runtime internally, so every call is moved onto the blocking pool with
//! [`tokio::task::spawn_blocking`].
//!
//! Data-change callbacks arrive on the client's publish thread and are fed
//! into the same bounded per-item queues the simulator uses; monitored items
//! are matched by client handle, not by node id text.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use gantry_types::{GantryError, NodeId, StatusCode};
use opcua::client::prelude::{
    AttributeId, AttributeService, Client, ClientBuilder, DataChangeCallback, DataValue,
    ExtensionObject, IdentityToken, MessageSecurityMode, MonitoredItemCreateRequest,
    MonitoringMode, MonitoringParameters, QualifiedName, ReadValueId, SecurityPolicy, Session,
    SessionCommand, SubscriptionService, TimestampsToReturn, UAString, UserTokenPolicy, Variant,
    WriteValue,
};
use opcua::sync::RwLock;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::queue::{QueueSink, monitored_queue};
use crate::transport::{
    Connection, DataChange, MonitoredItem, MonitoringParams, ProtocolSession, ReadResult,
    SubscriptionHandle, Transport,
};

type SharedSession = Arc<RwLock<Session>>;
type HandleMap = Arc<Mutex<HashMap<u32, (NodeId, QueueSink)>>>;

/// How often [`ProtocolSession::link_lost`] polls the client's connection flag.
const LINK_POLL: Duration = Duration::from_millis(500);

fn ua_node(node: &NodeId) -> Result<opcua::types::NodeId, GantryError> {
    opcua::types::NodeId::from_str(node.as_str())
        .map_err(|_| GantryError::UnknownPoint(node.to_string()))
}

fn ua_status(status: opcua::types::StatusCode) -> StatusCode {
    StatusCode(status.bits())
}

fn value_id(node: opcua::types::NodeId) -> ReadValueId {
    ReadValueId {
        node_id: node,
        attribute_id: AttributeId::Value as u32,
        index_range: UAString::null(),
        data_encoding: QualifiedName::null(),
    }
}

/// Run a blocking client call off the async runtime.  A failed service call
/// means the request never completed, which is treated as a link fault.
async fn blocking<T, F>(session: &SharedSession, call: F) -> Result<T, GantryError>
where
    T: Send + 'static,
    F: FnOnce(&Session) -> Result<T, opcua::types::StatusCode> + Send + 'static,
{
    let session = Arc::clone(session);
    tokio::task::spawn_blocking(move || {
        let guard = session.read();
        call(&guard)
    })
    .await
    .map_err(|e| GantryError::Transport(format!("client task failed: {e}")))?
    .map_err(|status| GantryError::Transport(ua_status(status).to_string()))
}

// ────────────────────────────────────────────────────────────────────────────
// Transport
// ────────────────────────────────────────────────────────────────────────────

/// Anonymous, unsecured OPC UA transport for one endpoint URL.
pub struct OpcUaTransport {
    endpoint: String,
}

impl OpcUaTransport {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl Transport for OpcUaTransport {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn connect(&self) -> Result<Box<dyn Connection>, GantryError> {
        let endpoint = self.endpoint.clone();
        let refused = |details: String| GantryError::Connection {
            endpoint: self.endpoint.clone(),
            details,
        };

        let client = tokio::task::spawn_blocking(move || {
            let client = ClientBuilder::new()
                .application_name("Gantry Bridge")
                .application_uri("urn:gantry-bridge")
                .create_sample_keypair(true)
                .trust_server_certs(true)
                .session_retry_limit(0)
                .client()
                .ok_or_else(|| "invalid client configuration".to_string())?;
            // Query the endpoint so an unreachable server is a connection
            // failure rather than a session failure.
            client
                .get_server_endpoints_from_url(endpoint.as_str())
                .map_err(|status| status.to_string())?;
            Ok::<Client, String>(client)
        })
        .await
        .map_err(|e| refused(e.to_string()))?
        .map_err(refused)?;

        Ok(Box::new(OpcUaConnection {
            endpoint: self.endpoint.clone(),
            client: Some(client),
        }))
    }
}

struct OpcUaConnection {
    endpoint: String,
    client: Option<Client>,
}

#[async_trait]
impl Connection for OpcUaConnection {
    async fn create_session(&mut self) -> Result<Box<dyn ProtocolSession>, GantryError> {
        let mut client = self
            .client
            .take()
            .ok_or_else(|| GantryError::Session("connection is closed".to_string()))?;
        let endpoint = self.endpoint.clone();

        let (client, result) = tokio::task::spawn_blocking(move || {
            let result = client.connect_to_endpoint(
                (
                    endpoint.as_str(),
                    SecurityPolicy::None.to_str(),
                    MessageSecurityMode::None,
                    UserTokenPolicy::anonymous(),
                ),
                IdentityToken::Anonymous,
            );
            (client, result)
        })
        .await
        .map_err(|e| GantryError::Session(e.to_string()))?;
        self.client = Some(client);

        let session = result.map_err(|status| GantryError::Session(ua_status(status).to_string()))?;
        let stop = Session::run_async(Arc::clone(&session));
        debug!(endpoint = %self.endpoint, "opc ua session activated");

        Ok(Box::new(OpcUaSession {
            session,
            stop: Mutex::new(Some(stop)),
            subscriptions: Mutex::new(HashMap::new()),
        }))
    }

    async fn disconnect(&mut self) -> Result<(), GantryError> {
        self.client = None;
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Session
// ────────────────────────────────────────────────────────────────────────────

struct OpcUaSession {
    session: SharedSession,
    stop: Mutex<Option<oneshot::Sender<SessionCommand>>>,
    subscriptions: Mutex<HashMap<u32, HandleMap>>,
}

#[async_trait]
impl ProtocolSession for OpcUaSession {
    async fn read(&self, nodes: &[NodeId]) -> Result<Vec<ReadResult>, GantryError> {
        let ids = nodes
            .iter()
            .map(|n| ua_node(n).map(value_id))
            .collect::<Result<Vec<_>, _>>()?;
        let values = blocking(&self.session, move |s| {
            s.read(&ids, TimestampsToReturn::Both, 0.0)
        })
        .await?;

        Ok(nodes
            .iter()
            .zip(values)
            .map(|(node, dv)| {
                let status = dv.status.map(ua_status).unwrap_or(StatusCode::GOOD);
                let value = match (&dv.value, status.is_good()) {
                    (Some(Variant::Boolean(b)), true) => Some(*b),
                    _ => None,
                };
                let status = if status.is_good() && value.is_none() {
                    StatusCode::BAD_TYPE_MISMATCH
                } else {
                    status
                };
                ReadResult {
                    node_id: node.clone(),
                    value,
                    status,
                }
            })
            .collect())
    }

    async fn write(&self, values: &[(NodeId, bool)]) -> Result<Vec<StatusCode>, GantryError> {
        let writes = values
            .iter()
            .map(|(node, value)| {
                Ok(WriteValue {
                    node_id: ua_node(node)?,
                    attribute_id: AttributeId::Value as u32,
                    index_range: UAString::null(),
                    value: DataValue::value_only(Variant::Boolean(*value)),
                })
            })
            .collect::<Result<Vec<_>, GantryError>>()?;
        let statuses = blocking(&self.session, move |s| s.write(&writes)).await?;
        Ok(statuses.into_iter().map(ua_status).collect())
    }

    async fn subscribe(
        &self,
        nodes: &[NodeId],
        params: &MonitoringParams,
    ) -> Result<SubscriptionHandle, GantryError> {
        let handles: HandleMap = Arc::new(Mutex::new(HashMap::new()));
        let mut items = Vec::with_capacity(nodes.len());
        let mut requests = Vec::with_capacity(nodes.len());
        for (i, node) in nodes.iter().enumerate() {
            let client_handle = i as u32 + 1;
            let (sink, queue) = monitored_queue(params.queue_size);
            handles
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(client_handle, (node.clone(), sink));
            items.push(MonitoredItem {
                node_id: node.clone(),
                queue,
            });
            requests.push(MonitoredItemCreateRequest::new(
                value_id(ua_node(node)?),
                MonitoringMode::Reporting,
                MonitoringParameters {
                    client_handle,
                    sampling_interval: params.sampling_interval.as_millis() as f64,
                    filter: ExtensionObject::null(),
                    queue_size: params.queue_size as u32,
                    discard_oldest: true,
                },
            ));
        }

        let callback_handles = Arc::clone(&handles);
        let callback = DataChangeCallback::new(move |changed| {
            let handles = callback_handles.lock().unwrap_or_else(|e| e.into_inner());
            for item in changed {
                let Some((node_id, sink)) = handles.get(&item.client_handle()) else {
                    continue;
                };
                let dv = item.last_value();
                let Some(Variant::Boolean(value)) = dv.value else {
                    continue;
                };
                let source_timestamp = dv
                    .source_timestamp
                    .map(|t| t.as_chrono())
                    .unwrap_or_else(chrono::Utc::now);
                sink.push(DataChange {
                    node_id: node_id.clone(),
                    value,
                    source_timestamp,
                });
            }
        });

        let p = params.clone();
        let subscription_id = blocking(&self.session, move |s| {
            s.create_subscription(
                p.publishing_interval.as_millis() as f64,
                p.lifetime_count,
                p.max_keep_alive_count,
                p.max_notifications_per_publish,
                p.priority,
                true,
                callback,
            )
        })
        .await
        .map_err(|e| GantryError::Subscription(e.to_string()))?;

        let results = blocking(&self.session, move |s| {
            s.create_monitored_items(subscription_id, TimestampsToReturn::Both, &requests)
        })
        .await
        .map_err(|e| GantryError::Subscription(e.to_string()))?;
        if let Some((node, bad)) = nodes
            .iter()
            .zip(&results)
            .find(|(_, r)| !r.status_code.is_good())
        {
            return Err(GantryError::Subscription(format!(
                "cannot monitor {node}: {}",
                ua_status(bad.status_code)
            )));
        }

        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(subscription_id, handles);
        Ok(SubscriptionHandle {
            id: subscription_id,
            items,
        })
    }

    async fn unsubscribe(&self, subscription_id: u32) -> Result<(), GantryError> {
        // Dropping the sinks closes the item queues even if the server call fails.
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&subscription_id);
        let status = blocking(&self.session, move |s| s.delete_subscription(subscription_id))
            .await
            .map_err(|e| GantryError::Subscription(e.to_string()))?;
        if !status.is_good() {
            return Err(GantryError::Subscription(ua_status(status).to_string()));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), GantryError> {
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        let stop = self.stop.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(stop) = stop {
            if stop.send(SessionCommand::Stop).is_err() {
                warn!("opc ua session loop already stopped");
            }
        }
        let session = Arc::clone(&self.session);
        tokio::task::spawn_blocking(move || session.write().disconnect())
            .await
            .map_err(|e| GantryError::Session(e.to_string()))
    }

    async fn link_lost(&self) {
        let mut interval = tokio::time::interval(LINK_POLL);
        loop {
            interval.tick().await;
            if !self.session.read().is_connected() {
                return;
            }
        }
    }
}
