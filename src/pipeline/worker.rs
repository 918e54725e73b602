//! One worker pass over a node.
//!
//! A pass applies a parked config request, runs the head command, reacts to
//! resource changes and finally lets the behavior process buffers. Passes of
//! one node never overlap: the whole pass holds the worker mutex. Events the
//! pass raises are delivered after the mutex is released.

use crate::pipeline::behavior::{WorkStatus, WorkerContext};
use crate::pipeline::command::Command;
use crate::pipeline::error::NodeError;
use crate::pipeline::event::Event;
use crate::pipeline::node::{Node, PassGuard, WorkerState};
use crate::pipeline::state::{NodeState, ResourcesState};
use std::time::Duration;
use tracing::{debug, trace, warn};

impl Node {
    /// Run one pass and tell the scheduler when to come back.
    pub fn run_worker(&self) -> WorkStatus {
        let status = {
            let _pass = PassGuard::enter(self.id());
            let mut ws = self.worker.lock();
            self.pass(&mut ws)
        };
        self.dispatch_events();
        status
    }

    fn pass(&self, ws: &mut WorkerState) -> WorkStatus {
        let settings = &self.env.settings;
        let mut status = WorkStatus::idle();

        self.perform_pending_config(ws);

        let mut stalled = false;
        let head = self.commands.lock().peek();
        if let Some(command) = head {
            if let Command::SetState(target) = command {
                if ws.prechecked != Some(command) {
                    ws.behavior.pre_check_change_state(target);
                    ws.prechecked = Some(command);
                }
            }
            match self.process_command(ws, command) {
                Err(NodeError::NotReady) => {
                    stalled = true;
                    status = status.merge(WorkStatus::after(Duration::from_millis(
                        settings.not_ready_backoff_ms,
                    )));
                }
                _ => {
                    self.commands.lock().pop();
                    ws.prechecked = None;
                }
            }
        }

        let queue_empty = self.commands.lock().is_empty();
        if queue_empty
            && matches!(
                self.state(),
                NodeState::Idle | NodeState::Executing | NodeState::Pause
            )
        {
            self.check_unpopulated(ws);
        }

        status = status.merge(self.check_resources(ws));

        let state = self.state();
        if state == NodeState::Executing && self.pending_state() == NodeState::Executing {
            status = status.merge(self.process_buffers(ws));
        } else if state == NodeState::Idle {
            status = status.merge(self.retry_pending());
        }

        if !self.commands.lock().is_empty() && !stalled {
            status.more_work = true;
        }
        trace!("{} pass done: {:?}", self.id(), status);
        status
    }

    fn pending_retry(&self) -> WorkStatus {
        WorkStatus::after(Duration::from_millis(self.env.settings.pending_retry_ms))
    }

    /// Buffers parked on the way out of Executing still need a home.
    fn retry_pending(&self) -> WorkStatus {
        for port in 0..self.port_count() {
            let tunneled = self.ports[port].lock().is_tunneled();
            if tunneled && self.has_pending(port) && self.send_pending(port).is_err() {
                return self.pending_retry();
            }
        }
        WorkStatus::idle()
    }

    fn process_buffers(&self, ws: &mut WorkerState) -> WorkStatus {
        for port in 0..self.port_count() {
            if let Err(e) = self.send_pending(port) {
                trace!("{} port {} pending not sent: {}", self.id(), port, e);
                return self.pending_retry();
            }
        }

        let mut all_ready = true;
        for port in 0..self.port_count() {
            let enabled = self.ports[port].lock().enabled;
            if enabled && !self.get_next_buffer(port) {
                all_ready = false;
            }
        }

        let mut ctx = WorkerContext::new(self);
        match ws.behavior.work(&mut ctx, all_ready) {
            Ok(status) => status,
            Err(NodeError::NotReady) => WorkStatus::idle(),
            Err(e) => {
                warn!("{} work failed: {}", self.id(), e);
                self.emit(Event::Error {
                    node: self.id(),
                    error: e,
                    port: None,
                });
                self.pending_retry()
            }
        }
    }

    fn check_unpopulated(&self, ws: &mut WorkerState) {
        let unpopulated: Vec<usize> = self
            .ports
            .iter()
            .enumerate()
            .filter(|(_, lock)| {
                let p = lock.lock();
                p.enabled && !p.populated
            })
            .map(|(i, _)| i)
            .collect();

        if unpopulated.is_empty() {
            ws.unpopulated_checks = 0;
            return;
        }
        ws.unpopulated_checks += 1;
        warn!(
            "{} in {} with unpopulated port(s) {:?}",
            self.id(),
            self.state(),
            unpopulated
        );
        if ws.unpopulated_checks == self.env.settings.unpopulated_warn_limit {
            for port in unpopulated {
                self.emit(Event::Error {
                    node: self.id(),
                    error: NodeError::PortUnpopulated,
                    port: Some(port),
                });
            }
        }
    }

    /// React to resources arriving or being taken away.
    fn check_resources(&self, ws: &mut WorkerState) -> WorkStatus {
        let resources = self.resources_state();
        let result = match (self.state(), resources) {
            (NodeState::WaitForResources, ResourcesState::Provided) => {
                debug!("{} resources provided", self.id());
                self.transition_to(ws, NodeState::Idle)
            }
            (NodeState::Executing | NodeState::Pause, ResourcesState::Reclaimed) => {
                if !ws.loss_reported {
                    self.emit(Event::Error {
                        node: self.id(),
                        error: NodeError::ResourcesPreempted,
                        port: None,
                    });
                    ws.loss_reported = true;
                }
                self.transition_to(ws, NodeState::Idle)
            }
            (NodeState::Idle, ResourcesState::Reclaimed) => {
                if self.pending_state() != NodeState::Loaded {
                    self.emit(Event::Error {
                        node: self.id(),
                        error: NodeError::ResourcesLost,
                        port: None,
                    });
                }
                ws.loss_reported = false;
                self.transition_to(ws, NodeState::Loaded)
            }
            _ => Ok(()),
        };
        match result {
            Err(NodeError::NotReady) => WorkStatus::after(Duration::from_millis(
                self.env.settings.not_ready_backoff_ms,
            )),
            // Preempted down to Idle; the way to Loaded starts next pass.
            Ok(()) if self.state() == NodeState::Idle
                && self.resources_state() == ResourcesState::Reclaimed =>
            {
                WorkStatus::more()
            }
            _ => WorkStatus::idle(),
        }
    }
}
