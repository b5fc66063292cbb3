// Qubit role assignment and amplitude addressing
use bitvec::prelude::*;

use crate::engine::error::{Result, SimError};

/// Which tier a qubit's bit is addressed through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Bit lives in the chunk id
    Primary,
    /// Bit lives in the intra-chunk offset
    Local,
}

/// A qubit's role and its position within that role's ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Slot {
    pub role: Role,
    pub position: usize,
}

impl Slot {
    pub fn primary(position: usize) -> Self {
        Slot {
            role: Role::Primary,
            position,
        }
    }

    pub fn local(position: usize) -> Self {
        Slot {
            role: Role::Local,
            position,
        }
    }
}

/// Bijection from qubit index to (role, position).
///
/// Primary position `i` is chunk-id bit `i`, local position `i` is offset
/// bit `i`. Qubit `q` owns global-index bit `n - 1 - q`. Every mutation
/// bumps `epoch`, which indexers use to notice stale tables.
#[derive(Debug, Clone)]
pub struct QubitPartition {
    slots: Vec<Slot>,
    primary: Vec<usize>,
    local: Vec<usize>,
    primary_set: BitVec,
    epoch: u64,
}

impl QubitPartition {
    /// Standard layout: chunk id holds the high global bits, offset the low ones.
    pub fn new(num_qubits: usize, num_primary: usize, num_local: usize) -> Result<Self> {
        if num_primary + num_local != num_qubits {
            return Err(SimError::partition(format!(
                "{num_primary} primary + {num_local} local != {num_qubits} qubits"
            )));
        }
        let slots = (0..num_qubits)
            .map(|q| {
                if q < num_primary {
                    Slot::primary(num_primary - 1 - q)
                } else {
                    Slot::local(num_qubits - 1 - q)
                }
            })
            .collect::<Vec<_>>();
        Self::from_role_map(num_primary, num_local, &slots)
    }

    /// Build from an explicit role map indexed by qubit.
    pub fn from_role_map(num_primary: usize, num_local: usize, role_map: &[Slot]) -> Result<Self> {
        let mut partition = QubitPartition {
            slots: Vec::new(),
            primary: vec![usize::MAX; num_primary],
            local: vec![usize::MAX; num_local],
            primary_set: bitvec![0; role_map.len()],
            epoch: 0,
        };
        partition.assign(role_map)?;
        partition.epoch = 0;
        Ok(partition)
    }

    /// Replace the whole assignment after checking it is a bijection onto
    /// `num_primary` primary and `num_local` local positions.
    pub fn assign(&mut self, role_map: &[Slot]) -> Result<()> {
        let num_primary = self.primary.len();
        let num_local = self.local.len();
        if num_primary + num_local != role_map.len() {
            return Err(SimError::partition(format!(
                "{num_primary} primary + {num_local} local != {} qubits",
                role_map.len()
            )));
        }

        let mut primary = vec![usize::MAX; num_primary];
        let mut local = vec![usize::MAX; num_local];
        for (qubit, slot) in role_map.iter().enumerate() {
            let order = match slot.role {
                Role::Primary => &mut primary,
                Role::Local => &mut local,
            };
            match order.get_mut(slot.position) {
                Some(entry) if *entry == usize::MAX => *entry = qubit,
                Some(entry) => {
                    return Err(SimError::partition(format!(
                        "qubits {} and {qubit} both claim {:?} position {}",
                        *entry, slot.role, slot.position
                    )))
                }
                None => {
                    return Err(SimError::partition(format!(
                        "qubit {qubit} has {:?} position {} outside the role's range",
                        slot.role, slot.position
                    )))
                }
            }
        }

        // Pigeonhole: sizes match and no position was claimed twice, so every
        // position is filled.
        let mut primary_set = bitvec![0; role_map.len()];
        for &q in &primary {
            primary_set.set(q, true);
        }
        self.slots = role_map.to_vec();
        self.primary = primary;
        self.local = local;
        self.primary_set = primary_set;
        self.epoch += 1;
        Ok(())
    }

    pub fn role_of(&self, qubit: usize) -> Result<Slot> {
        self.slots
            .get(qubit)
            .copied()
            .ok_or(SimError::QubitOutOfRange {
                qubit,
                num_qubits: self.num_qubits(),
            })
    }

    /// Exchange the roles of one primary and one local qubit. Moves no data.
    pub fn swap(&mut self, primary_qubit: usize, local_qubit: usize) -> Result<()> {
        let p = self.role_of(primary_qubit)?;
        let l = self.role_of(local_qubit)?;
        if p.role != Role::Primary || l.role != Role::Local {
            return Err(SimError::partition(format!(
                "swap needs a primary and a local qubit, got {primary_qubit} ({:?}) and {local_qubit} ({:?})",
                p.role, l.role
            )));
        }
        self.slots[primary_qubit] = Slot::local(l.position);
        self.slots[local_qubit] = Slot::primary(p.position);
        self.primary[p.position] = local_qubit;
        self.local[l.position] = primary_qubit;
        self.primary_set.set(primary_qubit, false);
        self.primary_set.set(local_qubit, true);
        self.epoch += 1;
        Ok(())
    }

    #[inline]
    pub fn is_primary(&self, qubit: usize) -> bool {
        self.primary_set[qubit]
    }

    /// Qubits in primary-position order
    pub fn primary_qubits(&self) -> &[usize] {
        &self.primary
    }

    /// Qubits in local-position order
    pub fn local_qubits(&self) -> &[usize] {
        &self.local
    }

    pub fn num_qubits(&self) -> usize {
        self.slots.len()
    }

    pub fn num_primary(&self) -> usize {
        self.primary.len()
    }

    pub fn num_local(&self) -> usize {
        self.local.len()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Global-index bit owned by `qubit`
    #[inline]
    pub fn global_bit(&self, qubit: usize) -> usize {
        self.num_qubits() - 1 - qubit
    }
}

/// Where one amplitude sits in the chunk store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Location {
    pub chunk: usize,
    pub offset: usize,
}

/// Bit-permutation tables derived from one partition epoch.
#[derive(Debug, Clone)]
pub struct AmplitudeIndexer {
    epoch: u64,
    primary_bits: Vec<usize>,
    local_bits: Vec<usize>,
}

impl AmplitudeIndexer {
    pub fn new(partition: &QubitPartition) -> Self {
        let table = |qubits: &[usize]| {
            qubits
                .iter()
                .map(|&q| partition.global_bit(q))
                .collect::<Vec<_>>()
        };
        Self {
            epoch: partition.epoch(),
            primary_bits: table(partition.primary_qubits()),
            local_bits: table(partition.local_qubits()),
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_current(&self, partition: &QubitPartition) -> bool {
        self.epoch == partition.epoch()
    }

    /// Rebuild the tables if the partition moved on since they were taken.
    pub fn refresh(&mut self, partition: &QubitPartition) {
        if !self.is_current(partition) {
            *self = Self::new(partition);
        }
    }

    #[inline]
    pub fn locate(&self, global: usize) -> Location {
        Location {
            chunk: gather(global, &self.primary_bits),
            offset: gather(global, &self.local_bits),
        }
    }

    #[inline]
    pub fn global_index(&self, chunk: usize, offset: usize) -> usize {
        scatter(chunk, &self.primary_bits) | scatter(offset, &self.local_bits)
    }

    /// Amplitudes per chunk
    pub fn chunk_len(&self) -> usize {
        1 << self.local_bits.len()
    }

    pub fn total_chunks(&self) -> usize {
        1 << self.primary_bits.len()
    }
}

/// Pack the bits of `value` found at `bits[i]` into bit `i` of the result.
#[inline]
fn gather(value: usize, bits: &[usize]) -> usize {
    bits.iter()
        .enumerate()
        .fold(0, |acc, (i, &b)| acc | (((value >> b) & 1) << i))
}

/// Inverse of `gather`.
#[inline]
fn scatter(packed: usize, bits: &[usize]) -> usize {
    bits.iter()
        .enumerate()
        .fold(0, |acc, (i, &b)| acc | (((packed >> i) & 1) << b))
}
