use std::net::{IpAddr, SocketAddr};
use std::ops::ControlFlow;
use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio_util::sync::CancellationToken;

use crate::config::DispatcherConfig;
use crate::error::{DispatchError, Result};
use crate::protocol::{Inbound, Message, Outbound};
use crate::scheduler::{
    ClusterOverview, HeartbeatMonitor, JobId, JobLedger, NodeId, NodeRegistry, NodeSnapshot,
};
use crate::transport::{Envelope, Transport};

/// Point-in-time summary returned for `GET_INFO`.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatcherInfo {
    pub nodes: Vec<NodeSnapshot>,
    pub queued: usize,
    pub allocated: usize,
}

impl From<ClusterOverview> for DispatcherInfo {
    fn from(overview: ClusterOverview) -> Self {
        Self {
            nodes: overview.nodes,
            queued: overview.queued,
            allocated: overview.allocated,
        }
    }
}

impl DispatcherInfo {
    /// `node_count,queued,allocated` followed by
    /// `node_id,node_jobs,utilization_percent` per node.
    pub fn to_arguments(&self) -> Vec<String> {
        let mut args = vec![
            self.nodes.len().to_string(),
            self.queued.to_string(),
            self.allocated.to_string(),
        ];
        for node in &self.nodes {
            args.push(node.id.to_string());
            args.push(node.allocated.to_string());
            args.push(format!("{:.2}", node.utilization * 100.0));
        }
        args
    }

    pub fn to_message(&self) -> Message {
        Message::new(Outbound::Info.as_str(), self.to_arguments())
    }
}

/// The dispatcher context: transport, ledger, registry, and failure detector.
///
/// Constructed once by [`Dispatcher::bind`] and consumed by
/// [`Dispatcher::run`], which drives the dispatch loop until `STOP_SYSTEM`
/// arrives or the shutdown token is cancelled.
pub struct Dispatcher {
    config: DispatcherConfig,
    transport: Transport,
    inbound: mpsc::UnboundedReceiver<Envelope>,
    ledger: Arc<JobLedger>,
    registry: Arc<NodeRegistry>,
    heartbeats: HeartbeatMonitor,
    controller: Option<SocketAddr>,
}

impl Dispatcher {
    /// Bind the transport and build an empty dispatcher.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Transport`] if the listen address cannot be bound.
    pub async fn bind(config: DispatcherConfig) -> Result<Self> {
        let (transport, inbound) =
            Transport::start(config.listen_addr, config.max_datagram_size).await?;
        let ledger = Arc::new(JobLedger::new());
        let registry = Arc::new(NodeRegistry::new(ledger.clone(), config.max_warnings));
        let heartbeats = HeartbeatMonitor::new(
            registry.clone(),
            transport.sender(),
            config.heartbeat_interval(),
            config.heartbeat_jitter_ms,
        );

        tracing::info!(
            addr = %transport.local_addr(),
            algorithm = %config.algorithm,
            heartbeat_interval_ms = config.heartbeat_interval_ms,
            "Dispatcher bound"
        );

        Ok(Self {
            config,
            transport,
            inbound,
            ledger,
            registry,
            heartbeats,
            controller: None,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    pub fn ledger(&self) -> Arc<JobLedger> {
        self.ledger.clone()
    }

    pub fn registry(&self) -> Arc<NodeRegistry> {
        self.registry.clone()
    }

    pub fn controller(&self) -> Option<SocketAddr> {
        self.controller
    }

    pub async fn info(&self) -> DispatcherInfo {
        self.registry.overview().await.into()
    }

    /// Run the dispatch loop.
    ///
    /// Each iteration handles at most one inbound message and makes at most
    /// one allocation. When neither happened the loop sleeps until a message
    /// arrives, the ledger changes, the idle tick elapses, or `shutdown` is
    /// cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Transport`] if the receive task died before a
    /// shutdown was requested. Shutdown still runs in that case.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        let idle_tick = self.config.idle_tick();
        let mut pending: Option<Envelope> = None;
        let mut outcome = Ok(());

        loop {
            let envelope = match pending.take() {
                Some(envelope) => Some(envelope),
                None => match self.inbound.try_recv() {
                    Ok(envelope) => Some(envelope),
                    Err(TryRecvError::Empty) => None,
                    Err(TryRecvError::Disconnected) => {
                        outcome = Err(receive_task_died());
                        break;
                    }
                },
            };

            let handled = envelope.is_some();
            if let Some(envelope) = envelope {
                if self.handle(envelope).await.is_break() {
                    break;
                }
            }

            let allocated = self.try_allocate().await;

            if shutdown.is_cancelled() {
                tracing::info!("Shutdown requested");
                break;
            }
            if handled || allocated {
                tokio::task::yield_now().await;
                continue;
            }

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    tracing::info!("Shutdown requested");
                    break;
                }
                received = self.inbound.recv() => match received {
                    Some(envelope) => pending = Some(envelope),
                    None => {
                        outcome = Err(receive_task_died());
                        break;
                    }
                },
                _ = self.ledger.changed() => {}
                _ = tokio::time::sleep(idle_tick) => {}
            }
        }

        if let Err(e) = &outcome {
            tracing::error!(error = %e, "Dispatch loop lost its transport");
        }
        self.shutdown_all().await;
        outcome
    }

    /// Allocate the head of the queue if a node qualifies.
    async fn try_allocate(&self) -> bool {
        let Some((job, node)) = self.registry.assign_next(self.config.algorithm).await else {
            return false;
        };

        tracing::info!(
            job_id = job.id,
            node_id = node.id,
            queue_wait_ms = job.queue_wait_ms().unwrap_or(0),
            "Job allocated"
        );
        let msg = Message::outbound(Outbound::NewJob)
            .with_arg(job.id)
            .with_arg(job.execution_time);
        self.transport.sender().send_or_log(&msg, node.endpoint()).await;
        true
    }

    async fn handle(&mut self, envelope: Envelope) -> ControlFlow<()> {
        let instruction = match envelope.message.inbound_instruction() {
            Ok(instruction) => instruction,
            Err(e) => {
                tracing::warn!(from = %envelope.from, error = %e, "Rejected message");
                return ControlFlow::Continue(());
            }
        };
        tracing::debug!(from = %envelope.from, %instruction, "Handling message");

        let result = match instruction {
            Inbound::RegController => self.handle_reg_controller(&envelope).await,
            Inbound::RegNode => self.handle_reg_node(&envelope).await,
            Inbound::NewJob => self.handle_new_job(&envelope).await,
            Inbound::FinJob => self.handle_fin_job(&envelope).await,
            Inbound::NewJobSuccess => self.handle_new_job_success(&envelope).await,
            Inbound::NewJobFailure => self.handle_new_job_failure(&envelope).await,
            Inbound::AckIsAlive => self.handle_ack_is_alive(&envelope).await,
            Inbound::GetInfo => self.handle_get_info(&envelope).await,
            Inbound::StopSystem => {
                tracing::info!(from = %envelope.from, "STOP_SYSTEM received");
                return ControlFlow::Break(());
            }
        };

        if let Err(e) = result {
            match e {
                DispatchError::JobNotFound(_)
                | DispatchError::NodeNotFound(_)
                | DispatchError::UnknownEndpoint(_) => {
                    tracing::info!(from = %envelope.from, %instruction, error = %e, "Ignored message");
                }
                _ => {
                    tracing::warn!(from = %envelope.from, %instruction, error = %e, "Rejected message");
                }
            }
        }
        ControlFlow::Continue(())
    }

    async fn reply(&self, message: Message, dest: SocketAddr) {
        self.transport.sender().send_or_log(&message, dest).await;
    }

    async fn notify_controller(&self, message: Message) {
        if let Some(controller) = self.controller {
            self.reply(message, controller).await;
        }
    }

    async fn handle_reg_controller(&mut self, envelope: &Envelope) -> Result<()> {
        let endpoint = match parse_endpoint_or_sender(&envelope.message, envelope.from) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                self.reply(Message::outbound(Outbound::RegFailure), envelope.from)
                    .await;
                return Err(e);
            }
        };

        match self.controller {
            Some(existing) if existing != endpoint => {
                self.reply(Message::outbound(Outbound::RegFailure), endpoint)
                    .await;
                Err(DispatchError::ControllerAlreadyRegistered(existing))
            }
            _ => {
                self.controller = Some(endpoint);
                self.reply(Message::outbound(Outbound::RegSuccess), endpoint)
                    .await;
                tracing::info!(endpoint = %endpoint, "Controller registered");
                Ok(())
            }
        }
    }

    async fn handle_reg_node(&mut self, envelope: &Envelope) -> Result<()> {
        let msg = &envelope.message;
        let parsed = msg.require_args("REG_NODE", 3).and_then(|_| {
            Ok((
                msg.parse_arg::<IpAddr>(0, "node address")?,
                msg.parse_arg::<u32>(1, "node port")?,
                msg.parse_arg::<u32>(2, "maximum capacity")?,
            ))
        });

        let (address, port, max_capacity) = match parsed {
            Ok(fields) => fields,
            Err(e) => {
                // Reply to the advertised endpoint when it parses
                let dest = advertised_endpoint(msg).unwrap_or(envelope.from);
                self.reply(Message::outbound(Outbound::RegFailure), dest).await;
                return Err(e.into());
            }
        };

        match self.registry.register(address, port, max_capacity).await {
            Ok(node) => {
                self.heartbeats.watch(&node).await;
                self.reply(
                    Message::outbound(Outbound::RegSuccess).with_arg(node.id),
                    node.endpoint(),
                )
                .await;
                Ok(())
            }
            Err(e) => {
                let dest = advertised_endpoint(msg).unwrap_or(envelope.from);
                self.reply(Message::outbound(Outbound::RegFailure), dest).await;
                Err(e)
            }
        }
    }

    async fn handle_new_job(&mut self, envelope: &Envelope) -> Result<()> {
        let reply_to = self.controller.unwrap_or(envelope.from);
        let msg = &envelope.message;

        let execution_time = match msg
            .require_args("NEW_JOB", 1)
            .and_then(|_| msg.parse_arg::<u32>(0, "execution time"))
        {
            Ok(t) => t,
            Err(e) => {
                self.reply(Message::outbound(Outbound::NewJobFailure), reply_to)
                    .await;
                return Err(e.into());
            }
        };

        match self.ledger.enqueue(execution_time).await {
            Ok(job) => {
                self.reply(
                    Message::outbound(Outbound::NewJobSuccess).with_arg(job.id),
                    reply_to,
                )
                .await;
                Ok(())
            }
            Err(e) => {
                self.reply(Message::outbound(Outbound::NewJobFailure), reply_to)
                    .await;
                Err(e)
            }
        }
    }

    async fn handle_fin_job(&mut self, envelope: &Envelope) -> Result<()> {
        let job_id = parse_job_id(&envelope.message, "FIN_JOB")?;
        let node_id = self.ledger.node_for_job(job_id).await;
        let mut job = self
            .ledger
            .deallocate(job_id)
            .await
            .ok_or(DispatchError::JobNotFound(job_id))?;
        job.finish();

        tracing::info!(job_id, node_id = node_id.unwrap_or_default(), state = %job.state, "Job finished");
        self.notify_controller(Message::outbound(Outbound::FinJob).with_arg(job_id))
            .await;
        Ok(())
    }

    async fn handle_new_job_success(&mut self, envelope: &Envelope) -> Result<()> {
        let job_id = parse_job_id(&envelope.message, "NEW_JOB_SUCCESS")?;
        let node_id = self
            .ledger
            .node_for_job(job_id)
            .await
            .ok_or(DispatchError::JobNotFound(job_id))?;
        tracing::info!(job_id, node_id, "Node accepted job");
        self.notify_controller(Message::outbound(Outbound::NewJobSuccess).with_arg(job_id))
            .await;
        Ok(())
    }

    async fn handle_new_job_failure(&mut self, envelope: &Envelope) -> Result<()> {
        let job_id = parse_job_id(&envelope.message, "NEW_JOB_FAILURE")?;
        let node_id = self.ledger.node_for_job(job_id).await;
        self.ledger
            .requeue_allocated(job_id)
            .await
            .ok_or(DispatchError::JobNotFound(job_id))?;

        tracing::warn!(
            job_id,
            node_id = node_id.unwrap_or_default(),
            reason = envelope.message.argument(1).unwrap_or(""),
            "Node rejected job"
        );
        self.notify_controller(Message::outbound(Outbound::NewJobFailure).with_arg(job_id))
            .await;
        Ok(())
    }

    async fn handle_ack_is_alive(&mut self, envelope: &Envelope) -> Result<()> {
        let msg = &envelope.message;
        let node_id: NodeId = if msg.arguments().is_empty() {
            self.registry
                .find_by_endpoint(envelope.from)
                .await
                .ok_or(DispatchError::UnknownEndpoint(envelope.from))?
                .id
        } else {
            msg.parse_arg(0, "node id")?
        };

        self.registry.acknowledge(node_id).await?;
        tracing::debug!(node_id, "Heartbeat acknowledged");
        Ok(())
    }

    async fn handle_get_info(&mut self, envelope: &Envelope) -> Result<()> {
        let info = self.info().await;
        self.reply(info.to_message(), envelope.from).await;
        Ok(())
    }

    /// Stop receiving, tell every node and the controller to stop, and cancel
    /// all heartbeats.
    async fn shutdown_all(&mut self) {
        self.transport.stop();

        let nodes = self.registry.drain().await;
        let stop_node = Message::outbound(Outbound::StopNode);
        for node in &nodes {
            self.reply(stop_node.clone(), node.endpoint()).await;
        }
        if let Some(controller) = self.controller.take() {
            self.reply(Message::outbound(Outbound::StopController), controller)
                .await;
        }

        self.heartbeats.stop().await;
        tracing::info!(nodes = nodes.len(), "Dispatcher stopped");
    }
}

fn receive_task_died() -> DispatchError {
    DispatchError::Transport(std::io::Error::other("receive task terminated"))
}

fn parse_job_id(msg: &Message, instruction: &'static str) -> Result<JobId> {
    msg.require_args(instruction, 1)?;
    Ok(msg.parse_arg(0, "job id")?)
}

/// `ip,port` from the first two arguments, if both parse.
fn advertised_endpoint(msg: &Message) -> Option<SocketAddr> {
    let address = msg.parse_arg::<IpAddr>(0, "address").ok()?;
    let port = msg.parse_arg::<u16>(1, "port").ok().filter(|p| *p != 0)?;
    Some(SocketAddr::new(address, port))
}

/// Controller endpoint from `ip,port` arguments, or the sender when absent.
fn parse_endpoint_or_sender(msg: &Message, from: SocketAddr) -> Result<SocketAddr> {
    if msg.arguments().is_empty() {
        return Ok(from);
    }
    msg.require_args("REG_CONTROLLER", 2)?;
    let address = msg.parse_arg::<IpAddr>(0, "controller address")?;
    let port = msg.parse_arg::<u32>(1, "controller port")?;
    match u16::try_from(port) {
        Ok(p) if p != 0 => Ok(SocketAddr::new(address, p)),
        _ => Err(DispatchError::Validation(format!("port {port} is out of range"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProtocolError;

    fn snapshot(id: NodeId, allocated: usize, max_capacity: u32) -> NodeSnapshot {
        NodeSnapshot {
            id,
            endpoint: "127.0.0.1:6000".parse().unwrap(),
            max_capacity,
            allocated,
            utilization: allocated as f64 / max_capacity as f64,
            warnings: 0,
        }
    }

    #[test]
    fn info_without_nodes() {
        let info = DispatcherInfo {
            nodes: vec![],
            queued: 3,
            allocated: 0,
        };
        assert_eq!(info.to_message().encode(), "INFO,0,3,0");
    }

    #[test]
    fn info_with_saturated_node() {
        let info = DispatcherInfo {
            nodes: vec![snapshot(1, 2, 2)],
            queued: 1,
            allocated: 2,
        };
        assert_eq!(info.to_arguments().join(","), "1,1,2,1,2,100.00");
    }

    #[test]
    fn info_formats_fractional_utilization() {
        let info = DispatcherInfo {
            nodes: vec![snapshot(1, 1, 3), snapshot(4, 0, 5)],
            queued: 0,
            allocated: 1,
        };
        assert_eq!(info.to_arguments().join(","), "2,0,1,1,1,33.33,4,0,0.00");
    }

    #[test]
    fn controller_endpoint_parsing() {
        let from: SocketAddr = "10.0.0.9:4000".parse().unwrap();

        let msg: Message = "REG_CONTROLLER".parse().unwrap();
        assert_eq!(parse_endpoint_or_sender(&msg, from).unwrap(), from);

        let msg: Message = "REG_CONTROLLER,127.0.0.1,7000".parse().unwrap();
        assert_eq!(
            parse_endpoint_or_sender(&msg, from).unwrap(),
            "127.0.0.1:7000".parse::<SocketAddr>().unwrap()
        );

        let msg: Message = "REG_CONTROLLER,127.0.0.1,70000".parse().unwrap();
        assert!(matches!(
            parse_endpoint_or_sender(&msg, from),
            Err(DispatchError::Validation(_))
        ));

        let msg: Message = "REG_CONTROLLER,127.0.0.1".parse().unwrap();
        assert!(matches!(
            parse_endpoint_or_sender(&msg, from),
            Err(DispatchError::Protocol(ProtocolError::MissingArgument { .. }))
        ));
    }

    #[test]
    fn advertised_endpoint_requires_valid_port() {
        let msg: Message = "REG_NODE,127.0.0.1,6001,x".parse().unwrap();
        assert_eq!(
            advertised_endpoint(&msg),
            Some("127.0.0.1:6001".parse().unwrap())
        );
        let msg: Message = "REG_NODE,127.0.0.1,0,2".parse().unwrap();
        assert_eq!(advertised_endpoint(&msg), None);
        let msg: Message = "REG_NODE,nowhere,6001,2".parse().unwrap();
        assert_eq!(advertised_endpoint(&msg), None);
    }
}
