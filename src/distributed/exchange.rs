//! All-to-all backend selection and the shared-memory exchange.
//!
//! The backend is chosen once per [`ExchangeRuntime`] from configuration and
//! resolved on the first multi-rank exchange:
//!
//! - `PassThrough`: return the input untouched
//! - `Standard`: the communicator's own all-to-all
//! - `External`: an exchange shared by all ranks of the address space,
//!   joined through a 128-byte identifier broadcast from rank 0
//!
//! `External` falls back to `Standard` when the communicator cannot share
//! memory between its ranks.

use super::{check_divisible, CollectiveCommunicator};
use crate::utils::config::CommunicationConfig;
use crate::utils::metrics;
use candle_core::{DType, Device, Error, Result, Tensor};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Barrier, Mutex, MutexGuard, OnceLock, Weak};
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

/// All-to-all transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum A2aBackend {
    PassThrough,
    #[default]
    Standard,
    External,
}

impl A2aBackend {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "pass_through" | "passthrough" | "skip" | "none" => Some(Self::PassThrough),
            "standard" | "native" => Some(Self::Standard),
            "external" | "shared" => Some(Self::External),
            code => code.parse::<u32>().ok().map(|c| Self::from_code(c).0),
        }
    }

    /// Decode the numeric form: bit 0 standard, bit 1 external, bit 3 timing,
    /// no transport bit means pass-through.
    pub fn from_code(code: u32) -> (Self, bool) {
        let timing = code & 8 != 0;
        let backend = if code & 1 != 0 {
            Self::Standard
        } else if code & 2 != 0 {
            Self::External
        } else {
            Self::PassThrough
        };
        (backend, timing)
    }
}

/// Opaque rendezvous token for the external exchange.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExchangeUniqueId(pub [u8; ExchangeUniqueId::BYTES]);

static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

impl ExchangeUniqueId {
    pub const BYTES: usize = 128;

    /// Fresh identifier, distinct from every other one generated in this process.
    ///
    /// Layout: serial (8 bytes), process id (4 bytes), then random v4 UUID bytes.
    pub fn generate() -> Self {
        let serial = ID_COUNTER.fetch_add(1, Ordering::Relaxed);

        let mut bytes = [0u8; Self::BYTES];
        bytes[..8].copy_from_slice(&serial.to_le_bytes());
        bytes[8..12].copy_from_slice(&std::process::id().to_le_bytes());
        for chunk in bytes[12..].chunks_mut(16) {
            let random = Uuid::new_v4();
            chunk.copy_from_slice(&random.as_bytes()[..chunk.len()]);
        }
        Self(bytes)
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        Tensor::from_slice(&self.0[..], Self::BYTES, device)
    }

    pub fn from_tensor(tensor: &Tensor) -> Result<Self> {
        let values = tensor.flatten_all()?.to_dtype(DType::U8)?.to_vec1::<u8>()?;
        let bytes: [u8; Self::BYTES] = values.try_into().map_err(|v: Vec<u8>| {
            Error::Msg(format!("exchange id must be {} bytes, got {}", Self::BYTES, v.len()))
        })?;
        Ok(Self(bytes))
    }
}

impl std::fmt::Debug for ExchangeUniqueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ExchangeUniqueId(")?;
        for b in &self.0[..8] {
            write!(f, "{:02x}", b)?;
        }
        write!(f, "..)")
    }
}

/// Mailbox shared by every rank that joined the same identifier.
pub struct SharedExchange {
    world_size: usize,
    slots: Mutex<Vec<Option<Tensor>>>,
    barrier: Barrier,
}

static EXCHANGES: OnceLock<Mutex<HashMap<ExchangeUniqueId, Weak<SharedExchange>>>> = OnceLock::new();

impl SharedExchange {
    /// Join the exchange named by `id`, creating it for the first arrival.
    pub fn join(id: ExchangeUniqueId, world_size: usize) -> Result<Arc<Self>> {
        if id.is_zero() {
            candle_core::bail!("cannot join an exchange with an empty identifier");
        }
        let registry = EXCHANGES.get_or_init(|| Mutex::new(HashMap::new()));
        let mut registry = registry
            .lock()
            .map_err(|_| Error::Msg("exchange registry poisoned".to_string()))?;

        if let Some(existing) = registry.get(&id).and_then(Weak::upgrade) {
            if existing.world_size != world_size {
                candle_core::bail!(
                    "exchange {:?} spans {} ranks, joined with {}",
                    id,
                    existing.world_size,
                    world_size
                );
            }
            return Ok(existing);
        }

        let exchange = Arc::new(Self {
            world_size,
            slots: Mutex::new((0..world_size).map(|_| None).collect()),
            barrier: Barrier::new(world_size),
        });
        registry.retain(|_, weak| weak.strong_count() > 0);
        registry.insert(id, Arc::downgrade(&exchange));
        Ok(exchange)
    }

    fn slots(&self) -> Result<MutexGuard<'_, Vec<Option<Tensor>>>> {
        self.slots
            .lock()
            .map_err(|_| Error::Msg("shared exchange poisoned".to_string()))
    }

    pub fn all_to_all(&self, rank: usize, tensor: &Tensor) -> Result<Tensor> {
        let chunk = check_divisible(tensor, self.world_size, "external all_to_all")?;
        self.slots()?[rank] = Some(tensor.clone());
        self.barrier.wait();

        let received = {
            let slots = self.slots()?;
            slots
                .iter()
                .enumerate()
                .map(|(src, t)| match t {
                    Some(t) => t.narrow(0, rank * chunk, chunk),
                    None => Err(Error::Msg(format!("rank {} sent nothing", src))),
                })
                .collect::<Result<Vec<_>>>()
        };
        self.barrier.wait();
        Tensor::cat(&received?, 0)
    }
}

/// Backend after negotiation.
#[derive(Clone)]
struct Resolved {
    backend: A2aBackend,
    exchange: Option<Arc<SharedExchange>>,
}

/// Process-wide all-to-all state.
///
/// A process that is one rank uses [`ExchangeRuntime::global`]. Threads that
/// simulate ranks may share a runtime (the global one included) or build one
/// each with [`ExchangeRuntime::from_config`].
pub struct ExchangeRuntime {
    backend: A2aBackend,
    timing: bool,
    resolved: Mutex<Option<Resolved>>,
}

static GLOBAL_RUNTIME: OnceLock<Arc<ExchangeRuntime>> = OnceLock::new();

impl ExchangeRuntime {
    pub fn new(backend: A2aBackend, timing: bool) -> Self {
        Self {
            backend,
            timing,
            resolved: Mutex::new(None),
        }
    }

    pub fn from_config(config: &CommunicationConfig) -> Self {
        Self::new(config.a2a_backend, config.a2a_timing)
    }

    /// Runtime configured from `MOE_A2A_BACKEND` / `MOE_A2A_TIMING` (or
    /// `A2A_TYPE`), created on first use and kept for the process lifetime.
    pub fn global() -> Arc<ExchangeRuntime> {
        GLOBAL_RUNTIME
            .get_or_init(|| Arc::new(Self::from_config(&CommunicationConfig::from_env())))
            .clone()
    }

    pub fn configured_backend(&self) -> A2aBackend {
        self.backend
    }

    pub fn timing(&self) -> bool {
        self.timing
    }

    fn state(&self) -> Result<MutexGuard<'_, Option<Resolved>>> {
        self.resolved
            .lock()
            .map_err(|_| Error::Msg("exchange runtime poisoned".to_string()))
    }

    /// Backend in use after negotiation, `None` before the first multi-rank exchange.
    pub fn resolved_backend(&self) -> Option<A2aBackend> {
        self.state().ok().and_then(|s| s.as_ref().map(|r| r.backend))
    }

    pub fn is_prepared(&self) -> bool {
        self.resolved_backend().is_some()
    }

    /// Resolve the backend on first use.
    ///
    /// Negotiation is a collective, so it runs without holding the state lock:
    /// ranks sharing one runtime all enter it together, and the first result
    /// stored wins. They join the same exchange, so every result is equivalent.
    fn prepare(&self, comm: &dyn CollectiveCommunicator) -> Result<Resolved> {
        if let Some(resolved) = self.state()?.as_ref() {
            return Ok(resolved.clone());
        }

        let resolved = self.negotiate(comm)?;

        let mut state = self.state()?;
        match state.as_ref() {
            Some(stored) => Ok(stored.clone()),
            None => {
                info!(
                    rank = comm.rank(),
                    world_size = comm.world_size(),
                    backend = ?resolved.backend,
                    timing = self.timing,
                    "All-to-all backend ready"
                );
                *state = Some(resolved.clone());
                Ok(resolved)
            }
        }
    }

    fn negotiate(&self, comm: &dyn CollectiveCommunicator) -> Result<Resolved> {
        let resolved = match self.backend {
            A2aBackend::External if !comm.shares_address_space() => {
                warn!(
                    world_size = comm.world_size(),
                    "External all-to-all unavailable for this communicator, falling back to standard"
                );
                Resolved { backend: A2aBackend::Standard, exchange: None }
            }
            A2aBackend::External => {
                let id = if comm.rank() == 0 {
                    ExchangeUniqueId::generate()
                } else {
                    ExchangeUniqueId([0u8; ExchangeUniqueId::BYTES])
                };
                let id = ExchangeUniqueId::from_tensor(&comm.broadcast(&id.to_tensor(&Device::Cpu)?, 0)?)?;
                let exchange = SharedExchange::join(id, comm.world_size())?;
                Resolved { backend: A2aBackend::External, exchange: Some(exchange) }
            }
            backend => Resolved { backend, exchange: None },
        };
        Ok(resolved)
    }

    /// Send chunk `j` of dim 0 to rank `j`, receive one chunk from every rank.
    ///
    /// `device` is the device the data lives on for callers, synchronized
    /// around the exchange when timing is enabled.
    pub fn exchange(&self, comm: &dyn CollectiveCommunicator, tensor: &Tensor, device: &Device) -> Result<Tensor> {
        let world_size = comm.world_size();
        if world_size <= 1 {
            return Ok(tensor.clone());
        }
        let resolved = self.prepare(comm)?;
        if resolved.backend == A2aBackend::PassThrough {
            return Ok(tensor.clone());
        }
        check_divisible(tensor, world_size, "all_to_all")?;

        let start = if self.timing {
            device.synchronize()?;
            Some(Instant::now())
        } else {
            None
        };

        let output = match &resolved.exchange {
            Some(exchange) => exchange.all_to_all(comm.rank(), tensor)?,
            None => comm.all_to_all(tensor)?,
        };

        if let Some(start) = start {
            device.synchronize()?;
            let secs = start.elapsed().as_secs_f64();
            if comm.rank() == 0 {
                let bytes = tensor.elem_count() * tensor.dtype().size_in_bytes();
                info!(
                    elements = tensor.elem_count(),
                    dtype = ?tensor.dtype(),
                    seconds = secs,
                    "AllToAll on message size ({} x {:?}) costs {} sec",
                    tensor.elem_count(),
                    tensor.dtype(),
                    secs
                );
                metrics::record_all_to_all(secs, bytes);
            }
        }
        Ok(output)
    }
}

impl std::fmt::Debug for ExchangeRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeRuntime")
            .field("backend", &self.backend)
            .field("timing", &self.timing)
            .field("resolved", &self.resolved_backend())
            .finish()
    }
}
