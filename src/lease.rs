//! In-memory lease pool.
//!
//! The pool is `range_size` consecutive addresses beginning at `start`; a
//! lease is identified by its offset into that range. [`LeaseTable`] holds
//! the offset → client mapping and the allocation algorithm. [`Leases`] is
//! the handle shared by dispatch workers: every read-modify-write runs under
//! one mutex.
//!
//! Leases never expire. An offset is only returned to the pool when the
//! client sends RELEASE or DECLINE.
//!
//! Allocation and binding are two separate steps because the inventory
//! record is created in between. [`LeaseTable::allocate_free`] therefore
//! *reserves* the offset it returns; the reservation is consumed by
//! [`LeaseTable::bind`] or dropped with [`LeaseTable::cancel`]. Reserved
//! offsets are not leases, they are just never handed out twice.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;

use rand::Rng;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::addr::{add_offset, offset_of};

/// Address range managed by this server. Immutable after startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Pool {
    /// First address handed out (offset 0).
    pub start: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    /// Number of allocable offsets, always > 0.
    pub range_size: usize,
}

impl Pool {
    /// Address of `offset`.
    pub fn address(&self, offset: usize) -> Ipv4Addr {
        add_offset(self.start, offset)
    }

    /// Offset of `address`, or `None` if it lies outside the pool.
    pub fn offset(&self, address: Ipv4Addr) -> Option<usize> {
        offset_of(self.start, address, self.range_size)
    }
}

/// A bound pool address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Lease {
    /// Client hardware address, `aa:bb:cc:dd:ee:ff`.
    pub client_id: String,
}

/// Result of [`LeaseTable::bind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bind {
    /// The offset was free and now belongs to the client.
    Bound(usize),
    /// The client already held this offset.
    Unchanged(usize),
    /// Another client holds the offset; nothing changed.
    Conflict(usize),
    /// The address is not managed by this pool; nothing changed.
    OutOfPool,
}

/// Offset → lease mapping for one pool.
#[derive(Debug)]
pub struct LeaseTable {
    range_size: usize,
    leases: HashMap<usize, Lease>,
    reserved: HashSet<usize>,
}

impl LeaseTable {
    pub fn new(range_size: usize) -> Self {
        Self {
            range_size,
            leases: HashMap::new(),
            reserved: HashSet::new(),
        }
    }

    fn is_free(&self, offset: usize) -> bool {
        !self.leases.contains_key(&offset) && !self.reserved.contains(&offset)
    }

    /// Reserves a free offset, probing from a random start so allocations do
    /// not all pile up at offset 0.
    pub fn allocate_free(&mut self) -> Option<usize> {
        if self.range_size == 0 {
            return None;
        }
        let start = rand::thread_rng().gen_range(0..self.range_size);
        self.allocate_free_from(start)
    }

    /// Reserves the first free offset scanning `start..range_size`, then
    /// `0..start`. Returns `None` when every offset is leased or reserved.
    pub fn allocate_free_from(&mut self, start: usize) -> Option<usize> {
        let start = start.min(self.range_size);
        let offset = (start..self.range_size)
            .chain(0..start)
            .find(|&offset| self.is_free(offset))?;
        self.reserved.insert(offset);
        Some(offset)
    }

    /// Drops a reservation made by [`allocate_free`](Self::allocate_free)
    /// that will not be bound.
    pub fn cancel(&mut self, offset: usize) {
        self.reserved.remove(&offset);
    }

    /// Binds `offset` to `client_id`.
    ///
    /// Offsets outside the pool are ignored. An offset held by a different
    /// client is never overwritten.
    pub fn bind(&mut self, client_id: &str, offset: Option<usize>) -> Bind {
        let Some(offset) = offset.filter(|&offset| offset < self.range_size) else {
            return Bind::OutOfPool;
        };
        self.reserved.remove(&offset);

        match self.leases.get(&offset) {
            Some(lease) if lease.client_id == client_id => Bind::Unchanged(offset),
            Some(_) => Bind::Conflict(offset),
            None => {
                self.leases.insert(
                    offset,
                    Lease {
                        client_id: client_id.to_string(),
                    },
                );
                Bind::Bound(offset)
            }
        }
    }

    /// Removes the first lease held by `client_id`, returning its offset.
    pub fn release(&mut self, client_id: &str) -> Option<usize> {
        let offset = self
            .leases
            .iter()
            .find(|(_, lease)| lease.client_id == client_id)
            .map(|(offset, _)| *offset)?;
        self.leases.remove(&offset);
        Some(offset)
    }

    /// Offset leased to `client_id`, if any.
    pub fn find(&self, client_id: &str) -> Option<usize> {
        self.leases
            .iter()
            .find(|(_, lease)| lease.client_id == client_id)
            .map(|(offset, _)| *offset)
    }

    pub fn get(&self, offset: usize) -> Option<&Lease> {
        self.leases.get(&offset)
    }

    /// Number of bound leases (reservations excluded).
    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }
}

/// Lease table shared by all dispatch workers.
///
/// # Example
///
/// ```
/// use std::net::Ipv4Addr;
/// use bootlease::lease::{Leases, Pool};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let leases = Leases::new(Pool {
///     start: Ipv4Addr::new(10, 0, 0, 1),
///     subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
///     gateway: Ipv4Addr::new(10, 0, 0, 254),
///     range_size: 3,
/// });
/// let offset = leases.allocate_free().await.unwrap();
/// let address = leases.pool().address(offset);
/// leases.bind("aa:bb:cc:dd:ee:ff", address).await;
/// assert_eq!(leases.lookup("aa:bb:cc:dd:ee:ff").await, Some(address));
/// # }
/// ```
#[derive(Debug)]
pub struct Leases {
    pool: Pool,
    table: Mutex<LeaseTable>,
}

impl Leases {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            table: Mutex::new(LeaseTable::new(pool.range_size)),
        }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Reserves a free offset; see [`LeaseTable::allocate_free`].
    pub async fn allocate_free(&self) -> Option<usize> {
        self.table.lock().await.allocate_free()
    }

    pub async fn cancel(&self, offset: usize) {
        self.table.lock().await.cancel(offset);
    }

    /// Binds the pool address `address` to `client_id`.
    pub async fn bind(&self, client_id: &str, address: Ipv4Addr) -> Bind {
        let offset = self.pool.offset(address);
        let mut table = self.table.lock().await;
        let outcome = table.bind(client_id, offset);

        match outcome {
            Bind::Bound(_) => info!(
                "DHCP server has assigned {} leases of a maximum {}",
                table.len(),
                self.pool.range_size
            ),
            Bind::Unchanged(_) => debug!(mac = client_id, %address, "lease already bound"),
            Bind::Conflict(offset) => warn!(
                mac = client_id,
                %address,
                holder = table.get(offset).map(|lease| lease.client_id.as_str()),
                "address already leased to another client"
            ),
            Bind::OutOfPool => debug!(mac = client_id, %address, "address outside managed pool"),
        }

        outcome
    }

    /// Releases the lease held by `client_id`, returning its address.
    pub async fn release(&self, client_id: &str) -> Option<Ipv4Addr> {
        let offset = self.table.lock().await.release(client_id)?;
        Some(self.pool.address(offset))
    }

    /// Address leased to `client_id`, if any.
    pub async fn lookup(&self, client_id: &str) -> Option<Ipv4Addr> {
        let offset = self.table.lock().await.find(client_id)?;
        Some(self.pool.address(offset))
    }

    /// Snapshot of every bound lease, ordered by address.
    pub async fn leases(&self) -> Vec<(Ipv4Addr, Lease)> {
        let table = self.table.lock().await;
        let mut leases: Vec<_> = table
            .leases
            .iter()
            .map(|(offset, lease)| (*offset, lease.clone()))
            .collect();
        drop(table);

        leases.sort_by_key(|(offset, _)| *offset);
        leases
            .into_iter()
            .map(|(offset, lease)| (self.pool.address(offset), lease))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.table.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.table.lock().await.is_empty()
    }
}
