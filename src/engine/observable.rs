// Pauli-sum observables
use std::fmt;
use std::str::FromStr;

use crate::engine::error::{Result, SimError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pauli {
    I,
    X,
    Y,
    Z,
}

impl Pauli {
    fn from_char(ch: char) -> Option<Self> {
        match ch.to_ascii_uppercase() {
            'I' => Some(Pauli::I),
            'X' => Some(Pauli::X),
            'Y' => Some(Pauli::Y),
            'Z' => Some(Pauli::Z),
            _ => None,
        }
    }
}

/// Tensor product of single-qubit Paulis; qubits not listed are identity.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PauliString {
    factors: Vec<(usize, Pauli)>,
}

/// A Pauli string acting on global basis states:
/// `P|g> = i^y_count * (-1)^popcount(g & phase) |g ^ flip>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PauliMasks {
    pub flip: usize,
    pub phase: usize,
    pub y_count: usize,
}

impl PauliString {
    pub fn new(factors: impl IntoIterator<Item = (usize, Pauli)>) -> Result<Self> {
        let mut factors: Vec<(usize, Pauli)> = factors
            .into_iter()
            .filter(|&(_, p)| p != Pauli::I)
            .collect();
        factors.sort_by_key(|&(q, _)| q);
        if let Some(pair) = factors.windows(2).find(|w| w[0].0 == w[1].0) {
            return Err(SimError::gate(format!(
                "qubit {} appears twice in a Pauli string",
                pair[0].0
            )));
        }
        Ok(Self { factors })
    }

    pub fn factors(&self) -> &[(usize, Pauli)] {
        &self.factors
    }

    pub fn is_identity(&self) -> bool {
        self.factors.is_empty()
    }

    /// Masks over an `num_qubits`-wide register (qubit `q` is global bit `n - 1 - q`).
    pub fn masks(&self, num_qubits: usize) -> Result<PauliMasks> {
        let mut masks = PauliMasks {
            flip: 0,
            phase: 0,
            y_count: 0,
        };
        for &(q, pauli) in &self.factors {
            if q >= num_qubits {
                return Err(SimError::QubitOutOfRange {
                    qubit: q,
                    num_qubits,
                });
            }
            let bit = 1usize << (num_qubits - 1 - q);
            match pauli {
                Pauli::I => {}
                Pauli::X => masks.flip |= bit,
                Pauli::Z => masks.phase |= bit,
                Pauli::Y => {
                    masks.flip |= bit;
                    masks.phase |= bit;
                    masks.y_count += 1;
                }
            }
        }
        Ok(masks)
    }
}

/// Character `i` is the Pauli on qubit `i`, e.g. `"XIZ"`.
impl FromStr for PauliString {
    type Err = SimError;

    fn from_str(text: &str) -> Result<Self> {
        let factors = text
            .chars()
            .enumerate()
            .map(|(q, ch)| {
                Pauli::from_char(ch)
                    .map(|p| (q, p))
                    .ok_or_else(|| SimError::gate(format!("'{ch}' is not a Pauli")))
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(factors)
    }
}

impl fmt::Display for PauliString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.factors.is_empty() {
            return write!(f, "I");
        }
        for (i, (q, p)) in self.factors.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{p:?}{q}")?;
        }
        Ok(())
    }
}

/// Real-weighted sum of Pauli strings.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Observable {
    terms: Vec<(f64, PauliString)>,
}

impl Observable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn term(mut self, coefficient: f64, pauli: PauliString) -> Self {
        self.terms.push((coefficient, pauli));
        self
    }

    /// Build from `(coefficient, "XIZ")` pairs.
    pub fn from_labels(labels: &[(f64, &str)]) -> Result<Self> {
        labels
            .iter()
            .try_fold(Self::new(), |obs, &(coefficient, label)| {
                Ok(obs.term(coefficient, label.parse()?))
            })
    }

    pub fn terms(&self) -> &[(f64, PauliString)] {
        &self.terms
    }
}
