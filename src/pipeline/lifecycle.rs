//! State transitions and command execution.
//!
//! Everything here runs on the worker with the worker mutex held; callers
//! pass the locked `WorkerState` in.

use crate::pipeline::command::{Command, PortTarget};
use crate::pipeline::error::{NodeError, NodeResult};
use crate::pipeline::event::Event;
use crate::pipeline::node::{Node, WorkerState};
use crate::pipeline::state::NodeState;
use tracing::{debug, error, info, warn};

impl Node {
    /// Attempt the transition to `target`.
    ///
    /// `NotReady` leaves the pending state at `target` so the retried command
    /// can pick up where it stopped. Any other setup failure restores the
    /// pending state; teardown failures move the node to `Invalid`.
    pub(crate) fn change_state(&self, ws: &mut WorkerState, target: NodeState) -> NodeResult<()> {
        let current = self.state();
        if current == target {
            return Err(NodeError::SameState);
        }
        if !current.can_transition_to(target) {
            return Err(NodeError::IncorrectStateTransition);
        }

        self.status.set_pending(target);
        ws.behavior.pre_change_state(current, target);

        match self.enter_state(ws, current, target) {
            Ok(()) => {}
            Err(NodeError::NotReady) => {
                debug!("{} {} -> {} not ready", self.id(), current, target);
                return Err(NodeError::NotReady);
            }
            Err(e) => {
                if self.state() != NodeState::Invalid {
                    self.status.set_pending(current);
                }
                return Err(e);
            }
        }

        if let Err(e) = ws.behavior.change_state(current, target) {
            self.status.set_pending(current);
            return Err(e);
        }
        if current == NodeState::WaitForResources {
            self.cancel_resource_wait();
        }
        self.status.commit(target);
        ws.unpopulated_checks = 0;
        info!("{} '{}' {} -> {}", self.id(), self.name(), current, target);
        Ok(())
    }

    fn enter_state(&self, ws: &mut WorkerState, current: NodeState, target: NodeState) -> NodeResult<()> {
        let ports = 0..self.port_count();
        match target {
            NodeState::Loaded | NodeState::Invalid => {
                if current.is_running() && target != NodeState::Invalid {
                    for port in ports.clone() {
                        self.return_port_buffers(port)?;
                    }
                }
                if current == NodeState::WaitForResources {
                    self.cancel_resource_wait();
                }

                let mut result = self.release_resources(ws);
                for port in ports.clone() {
                    let released = self.release_port_resources(port);
                    if result.is_ok() {
                        result = released;
                    }
                }

                if target == NodeState::Invalid {
                    for port in ports {
                        let mut p = self.ports[port].lock();
                        p.tunnel = None;
                    }
                    return Ok(());
                }
                match result {
                    Ok(()) | Err(NodeError::NotReady) => result,
                    Err(e) => {
                        error!("{} teardown failed, moving to Invalid: {}", self.id(), e);
                        self.status.commit(NodeState::Invalid);
                        Err(e)
                    }
                }
            }

            NodeState::Idle if current.is_running() => {
                for port in ports {
                    self.return_port_buffers(port)?;
                }
                if self.can_stop(ws.was_executing) {
                    Ok(())
                } else {
                    Err(NodeError::NotReady)
                }
            }

            NodeState::Idle => {
                self.decide_all_sharing()?;
                let mut not_ready = false;
                for port in ports.clone() {
                    match self.create_tunnel(port) {
                        Ok(()) => {}
                        Err(NodeError::NotReady) => not_ready = true,
                        Err(e) => return Err(e),
                    }
                }
                if not_ready {
                    return Err(NodeError::NotReady);
                }

                if let Err(e) = self.acquire_resources(ws) {
                    warn!("{} cannot reach Idle: {}", self.id(), e);
                    if let Err(e) = self.release_resources(ws) {
                        debug!("{} release after failed acquire: {}", self.id(), e);
                    }
                    for port in ports {
                        if let Err(e) = self.release_port_resources(port) {
                            debug!("{} port {} teardown after failed acquire: {}", self.id(), port, e);
                        }
                    }
                    return Err(NodeError::InsufficientResources);
                }
                ws.was_executing = false;
                Ok(())
            }

            NodeState::Executing => {
                if current == NodeState::Pause && ws.was_executing {
                    return Ok(());
                }
                let mut not_ready = false;
                for port in ports {
                    if !self.ports[port].lock().enabled {
                        continue;
                    }
                    match self.start_port(port) {
                        Ok(()) => {}
                        Err(NodeError::NotReady) => not_ready = true,
                        Err(e) => return Err(e),
                    }
                }
                if not_ready {
                    return Err(NodeError::NotReady);
                }
                ws.was_executing = true;
                Ok(())
            }

            NodeState::Pause => Ok(()),

            NodeState::WaitForResources => self.wait_for_resources(),
        }
    }

    /// Change state and report the outcome like a `SetState` command.
    pub(crate) fn transition_to(&self, ws: &mut WorkerState, target: NodeState) -> NodeResult<()> {
        let result = self.change_state(ws, target);
        if result != Err(NodeError::NotReady) {
            self.complete_command(Command::SetState(target), result.clone());
        }
        result
    }

    /// Raise the completion or failure event for `command`.
    pub(crate) fn complete_command(&self, command: Command, result: NodeResult<()>) {
        let event = if self.state() == NodeState::Invalid {
            Event::Error {
                node: self.id(),
                error: NodeError::InvalidState,
                port: None,
            }
        } else {
            match result {
                Ok(()) => Event::CommandComplete {
                    node: self.id(),
                    command,
                },
                Err(error) => Event::CommandFailed {
                    node: self.id(),
                    command,
                    error,
                },
            }
        };
        self.emit(event);
    }

    /// Execute one queued command. `Err(NotReady)` means keep it queued;
    /// any other outcome has already been reported.
    pub(crate) fn process_command(&self, ws: &mut WorkerState, command: Command) -> NodeResult<()> {
        debug!("{} processing {:?}", self.id(), command);
        match command {
            Command::SetState(target) => {
                let result = self.change_state(ws, target);
                if result == Err(NodeError::NotReady) {
                    return result;
                }
                self.complete_command(command, result);
                Ok(())
            }
            Command::Flush(target) => self.finish_port_command(command, self.flush_ports(ws, target)),
            Command::EnablePort(target) => {
                self.finish_port_command(command, self.enable_ports(ws, target))
            }
            Command::DisablePort(target) => {
                self.finish_port_command(command, self.disable_ports(ws, target))
            }
            Command::MarkBuffer(port, mark) => {
                let result = self.port(port).and_then(|lock| {
                    let mut p = lock.lock();
                    if !p.enabled {
                        return Err(NodeError::IncorrectStateOperation);
                    }
                    p.marks.push_back(mark);
                    Ok(())
                });
                self.complete_command(command, result);
                Ok(())
            }
        }
    }

    fn finish_port_command(&self, command: Command, result: NodeResult<()>) -> NodeResult<()> {
        match result {
            Ok(()) => Ok(()),
            Err(NodeError::NotReady) => Err(NodeError::NotReady),
            Err(e) => {
                self.complete_command(command, Err(e));
                Ok(())
            }
        }
    }

    /// Per-port completions, then one for the whole target when it was `All`.
    fn report_ports(&self, target: PortTarget, make: fn(PortTarget) -> Command) {
        for port in target.ports(self.port_count()) {
            self.complete_command(make(PortTarget::Index(port)), Ok(()));
        }
        if target == PortTarget::All {
            self.complete_command(make(PortTarget::All), Ok(()));
        }
    }

    fn flush_ports(&self, ws: &mut WorkerState, target: PortTarget) -> NodeResult<()> {
        ws.behavior.flush(target)?;
        let mut result = Ok(());
        for port in target.ports(self.port_count()) {
            if let Err(e) = self.flush_port(port) {
                debug!("{} port {} flush: {}", self.id(), port, e);
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result?;
        self.report_ports(target, Command::Flush);
        Ok(())
    }

    fn disable_ports(&self, ws: &mut WorkerState, target: PortTarget) -> NodeResult<()> {
        let loaded = self.state() == NodeState::Loaded;
        for port in target.ports(self.port_count()) {
            if loaded {
                self.ports[port].lock().enabled = false;
                continue;
            }
            self.stop_port(port)?;
            ws.behavior.port_event(port, false)?;
        }
        self.report_ports(target, Command::DisablePort);
        Ok(())
    }

    fn enable_ports(&self, ws: &mut WorkerState, target: PortTarget) -> NodeResult<()> {
        let state = self.state();
        for port in target.ports(self.port_count()) {
            if state == NodeState::Loaded {
                self.ports[port].lock().enabled = true;
                continue;
            }
            if !self.ports[port].lock().is_ready() {
                self.restart_port(port, state == NodeState::Idle)?;
                ws.behavior.port_event(port, true)?;
            }
        }
        self.report_ports(target, Command::EnablePort);
        Ok(())
    }

    /// Return buffers and free the pool, then disable.
    fn stop_port(&self, port: usize) -> NodeResult<()> {
        let enabled = self.ports[port].lock().enabled;
        let mut result = Ok(());
        if enabled {
            result = self.return_port_buffers(port);
            let released = self.release_port_resources(port);
            if result.is_ok() {
                result = released;
            }
        }
        let mut p = self.ports[port].lock();
        if p.n_buffers != 0 {
            return Err(NodeError::NotReady);
        }
        result?;
        p.enabled = false;
        info!("{} port {} disabled", self.id(), port);
        Ok(())
    }

    /// Re-populate and, unless idle, start a port being enabled.
    fn restart_port(&self, port: usize, idle: bool) -> NodeResult<()> {
        if !self.ports[port].lock().populated {
            self.create_tunnel(port)?;
        }
        if !self.ports[port].lock().populated {
            return Err(NodeError::NotReady);
        }
        if !idle {
            if let Err(e) = self.start_port(port) {
                self.ports[port].lock().enabled = false;
                return Err(e);
            }
        }
        self.ports[port].lock().enabled = true;
        info!("{} port {} enabled", self.id(), port);
        Ok(())
    }
}
