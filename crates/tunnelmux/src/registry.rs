//! Tunnel registry
//!
//! Owns every pending reservation and every assigned tunnel of one
//! connection generation. Only the driver task touches it, so it needs no
//! locking of its own.

use crate::tunnel::{InboundQueue, Tunnel};
use crate::{MuxError, Result};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{oneshot, Notify};
use tokio::time::{Duration, Instant};
use tracing::debug;
use tunnelmux_proto::{BindingKey, TunnelId};

/// What a successful open hands back to the caller
#[derive(Debug)]
pub(crate) struct OpenedTunnel {
    pub(crate) generation: u64,
    pub(crate) id: TunnelId,
    pub(crate) binding: BindingKey,
    pub(crate) queue: Arc<InboundQueue>,
}

pub(crate) type OpenWaiter = oneshot::Sender<Result<OpenedTunnel>>;

/// A tunnel known only by its binding key
#[derive(Debug)]
pub(crate) struct PendingTunnel {
    pub(crate) reservation: u64,
    pub(crate) binding: BindingKey,
    pub(crate) created_at: Instant,
    pub(crate) deadline: Instant,
    pub(crate) cancelled_at: Option<Instant>,
    pub(crate) waiter: Option<OpenWaiter>,
}

impl PendingTunnel {
    /// Still wanted by somebody
    pub(crate) fn is_live(&self) -> bool {
        self.cancelled_at.is_none() && self.waiter.as_ref().map_or(true, |w| !w.is_closed())
    }

    /// Give up on this reservation, failing the waiting caller with `err`.
    ///
    /// The entry stays queued so that a late assignment still pairs with it.
    pub(crate) fn cancel(&mut self, now: Instant, err: MuxError) {
        self.cancelled_at.get_or_insert(now);
        if let Some(waiter) = self.waiter.take() {
            let _ = waiter.send(Err(err));
        }
    }
}

/// Result of pairing a server assignment with a reservation
#[derive(Debug)]
pub(crate) enum Assignment {
    /// The reservation was live; the tunnel is now open
    Opened {
        opened: OpenedTunnel,
        waiter: Option<OpenWaiter>,
    },
    /// Nobody wants the tunnel anymore; the server side must be closed
    Cancelled,
}

/// Maps binding keys to reservations and tunnel ids to tunnel state
#[derive(Debug)]
pub(crate) struct Registry {
    generation: u64,
    inbound_capacity: usize,
    resume: Arc<Notify>,
    next_reservation: u64,
    pending: HashMap<BindingKey, VecDeque<PendingTunnel>>,
    tunnels: HashMap<TunnelId, Tunnel>,
    active: HashMap<BindingKey, TunnelId>,
    /// Ids this generation has seen and let go. Ids are never reused within
    /// a generation, so a late or repeated assignment of any of these is
    /// refused. Grows by one per tunnel and is cleared by [`Registry::reset`]
    /// when the next generation starts.
    retired: HashSet<TunnelId>,
}

impl Registry {
    pub(crate) fn new(generation: u64, inbound_capacity: usize, resume: Arc<Notify>) -> Self {
        Self {
            generation,
            inbound_capacity,
            resume,
            next_reservation: 1,
            pending: HashMap::new(),
            tunnels: HashMap::new(),
            active: HashMap::new(),
            retired: HashSet::new(),
        }
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    /// Reserve `binding` for a tunnel the server has not assigned yet.
    ///
    /// Fails with [`MuxError::DuplicateBinding`] while an active tunnel or a
    /// live reservation holds the same key.
    pub(crate) fn reserve(
        &mut self,
        binding: BindingKey,
        now: Instant,
        open_timeout: Duration,
    ) -> Result<&mut PendingTunnel> {
        let reserved = self
            .pending
            .get(&binding)
            .is_some_and(|queue| queue.iter().any(PendingTunnel::is_live));
        if reserved || self.active.contains_key(&binding) {
            return Err(MuxError::DuplicateBinding(binding));
        }

        let reservation = self.next_reservation;
        self.next_reservation += 1;
        debug!("Reserved {} as reservation {}", binding, reservation);

        let queue = self.pending.entry(binding.clone()).or_default();
        queue.push_back(PendingTunnel {
            reservation,
            binding,
            created_at: now,
            deadline: now + open_timeout,
            cancelled_at: None,
            waiter: None,
        });
        let last = queue.len() - 1;
        Ok(&mut queue[last])
    }

    /// Pair a server assignment with the oldest reservation for `binding`
    pub(crate) fn assign(&mut self, binding: &BindingKey, id: TunnelId, now: Instant) -> Result<Assignment> {
        if self.tunnels.contains_key(&id) || self.retired.contains(&id) {
            return Err(MuxError::ProtocolViolation(format!(
                "tunnel id {} reused for {}",
                id, binding
            )));
        }

        let mut pending = self
            .pending
            .get_mut(binding)
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| MuxError::UnknownBinding(binding.clone()))?;
        if self.pending.get(binding).is_some_and(VecDeque::is_empty) {
            self.pending.remove(binding);
        }

        if !pending.is_live() {
            debug!(
                "Assignment of tunnel {} hit cancelled reservation {}",
                id, pending.reservation
            );
            self.retired.insert(id);
            return Ok(Assignment::Cancelled);
        }

        let queue = Arc::new(InboundQueue::new(self.inbound_capacity, Arc::clone(&self.resume)));
        self.tunnels
            .insert(id, Tunnel::open(id, binding.clone(), Arc::clone(&queue), now));
        self.active.insert(binding.clone(), id);

        Ok(Assignment::Opened {
            opened: OpenedTunnel {
                generation: self.generation,
                id,
                binding: binding.clone(),
                queue,
            },
            waiter: pending.waiter.take(),
        })
    }

    /// Fail the oldest reservation for `binding` after the server refused it.
    ///
    /// Returns false when no reservation matched.
    pub(crate) fn reject(&mut self, binding: &BindingKey, message: &str, now: Instant) -> bool {
        let Some(mut pending) = self.pending.get_mut(binding).and_then(VecDeque::pop_front) else {
            return false;
        };
        if self.pending.get(binding).is_some_and(VecDeque::is_empty) {
            self.pending.remove(binding);
        }
        pending.cancel(
            now,
            MuxError::Rejected {
                binding: binding.clone(),
                message: message.to_string(),
            },
        );
        true
    }

    pub(crate) fn lookup(&self, id: TunnelId) -> Option<&Tunnel> {
        self.tunnels.get(&id)
    }

    pub(crate) fn lookup_mut(&mut self, id: TunnelId) -> Option<&mut Tunnel> {
        self.tunnels.get_mut(&id)
    }

    /// Active tunnel holding `binding`, if any
    #[cfg(test)]
    pub(crate) fn active_for(&self, binding: &BindingKey) -> Option<TunnelId> {
        self.active.get(binding).copied()
    }

    /// Free the binding of a tunnel that reached a terminal state.
    ///
    /// The tunnel itself stays registered until its subscribers drain it.
    pub(crate) fn release(&mut self, id: TunnelId) {
        if let Some(tunnel) = self.tunnels.get(&id) {
            if self.active.get(tunnel.binding()) == Some(&id) {
                self.active.remove(tunnel.binding());
            }
        }
    }

    /// Remove a tunnel. Idempotent; the id is never accepted again.
    pub(crate) fn remove(&mut self, id: TunnelId) -> Option<Tunnel> {
        self.release(id);
        self.retired.insert(id);
        self.tunnels.remove(&id)
    }

    /// Whether `id` belonged to a tunnel of this generation that is gone now
    pub(crate) fn is_retired(&self, id: TunnelId) -> bool {
        self.retired.contains(&id)
    }

    /// Fail reservations whose deadline passed and forget abandoned ones.
    ///
    /// Returns the number of reservations that timed out.
    pub(crate) fn expire_pending(&mut self, now: Instant, open_timeout: Duration) -> usize {
        let mut expired = 0;
        for pending in self.pending.values_mut().flat_map(|queue| queue.iter_mut()) {
            if !pending.is_live() {
                pending.cancelled_at.get_or_insert(now);
                continue;
            }
            if now >= pending.deadline {
                let binding = pending.binding.clone();
                debug!(
                    "Reservation {} for {} timed out after {:?}",
                    pending.reservation,
                    binding,
                    now.saturating_duration_since(pending.created_at)
                );
                pending.cancel(
                    now,
                    MuxError::OpenTimeout {
                        binding,
                        timeout: open_timeout,
                    },
                );
                expired += 1;
            }
        }
        expired
    }

    /// Drop cancelled reservations that waited `orphan_ttl` for an assignment
    pub(crate) fn prune_cancelled(&mut self, now: Instant, orphan_ttl: Duration) -> usize {
        let mut pruned = 0;
        self.pending.retain(|_, queue| {
            let before = queue.len();
            queue.retain(|pending| {
                pending
                    .cancelled_at
                    .map_or(true, |at| now.saturating_duration_since(at) < orphan_ttl)
            });
            pruned += before - queue.len();
            !queue.is_empty()
        });
        pruned
    }

    /// Ids of all registered tunnels
    pub(crate) fn ids(&self) -> Vec<TunnelId> {
        self.tunnels.keys().copied().collect()
    }

    pub(crate) fn tunnels_mut(&mut self) -> impl Iterator<Item = &mut Tunnel> {
        self.tunnels.values_mut()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.tunnels.len()
    }

    /// Number of reservations still waiting for an assignment
    pub(crate) fn pending_len(&self) -> usize {
        self.pending
            .values()
            .flat_map(|queue| queue.iter())
            .filter(|pending| pending.is_live())
            .count()
    }

    /// Empty the registry for a new connection generation, handing back
    /// whatever was still in it
    pub(crate) fn reset(&mut self, generation: u64) -> (Vec<PendingTunnel>, Vec<Tunnel>) {
        debug!(
            "Registry generation {} -> {} ({} tunnels, {} pending)",
            self.generation,
            generation,
            self.tunnels.len(),
            self.pending_len()
        );
        self.generation = generation;
        self.active.clear();
        self.retired.clear();
        let pending = self
            .pending
            .drain()
            .flat_map(|(_, queue)| queue)
            .collect();
        let tunnels = self.tunnels.drain().map(|(_, tunnel)| tunnel).collect();
        (pending, tunnels)
    }
}

#[cfg(test)]
mod tests;
