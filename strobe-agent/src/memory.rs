//! Memory read/write service: one-shot recipes from the daemon, plus the
//! polled mode that re-reads a recipe set on a timer and emits variable
//! snapshots.
//!
//! Recipes address DWARF-resolved targets (slide applied) or raw addresses
//! (`noSlide`). Failures are per-target: one bad recipe never spoils its
//! siblings.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde_json::{Value, json};

use crate::error::{CommandError, MemoryError};
use crate::framework::MemoryAccess;
use crate::protocol::{PollSpec, ReadResult, Recipe, parse_hex_addr};

const POLL_INTERVAL_MS: std::ops::RangeInclusive<u64> = 50..=5000;
const POLL_DURATION_MS: std::ops::RangeInclusive<u64> = 100..=30000;
const MAX_BYTES_READ: usize = 4096;

/// Validate a recipe batch before touching memory. Violations reject the
/// whole command.
fn validate(recipes: &[Recipe]) -> Result<(), CommandError> {
    for recipe in recipes {
        if recipe.deref_depth > 1 {
            return Err(CommandError::validation(format!(
                "recipe {:?}: deref depth must be 0 or 1",
                recipe.label
            )));
        }
        let is_bytes = recipe.type_kind.as_deref() == Some("bytes");
        if !recipe.is_struct && !is_bytes && !matches!(recipe.size, 1 | 2 | 4 | 8) {
            return Err(CommandError::validation(format!(
                "recipe {:?}: size must be 1, 2, 4 or 8",
                recipe.label
            )));
        }
    }
    Ok(())
}

/// Resolve a recipe's effective address: slide, then the deref chain.
fn resolve_address(
    mem: &dyn MemoryAccess,
    recipe: &Recipe,
    slide: i64,
) -> Result<u64, MemoryError> {
    let static_addr = parse_hex_addr(&recipe.address)
        .map_err(|_| MemoryError::AddressNotReadable(0))?;
    let base = if recipe.no_slide {
        static_addr
    } else {
        static_addr.wrapping_add(slide as u64)
    };
    if recipe.deref_depth == 0 {
        return Ok(base);
    }
    if base % 8 != 0 {
        return Err(MemoryError::InvalidAlignment {
            addr: base,
            size: 8,
        });
    }
    let mut ptr_bytes = [0u8; 8];
    mem.read(base, &mut ptr_bytes)?;
    let pointer = u64::from_le_bytes(ptr_bytes);
    if pointer == 0 {
        return Err(MemoryError::NullPointer(recipe.label.clone()));
    }
    Ok(pointer.wrapping_add(recipe.deref_offset))
}

fn read_scalar(
    mem: &dyn MemoryAccess,
    addr: u64,
    size: u8,
    type_kind: Option<&str>,
) -> Result<Value, MemoryError> {
    if addr % size.max(1) as u64 != 0 {
        return Err(MemoryError::InvalidAlignment { addr, size });
    }
    let mut buf = [0u8; 8];
    mem.read(addr, &mut buf[..size as usize])?;
    let unsigned = u64::from_le_bytes(buf);
    Ok(match type_kind {
        Some("int") => {
            let shift = 64 - size as u32 * 8;
            json!(((unsigned << shift) as i64) >> shift)
        }
        Some("float") => match size {
            4 => json!(f32::from_le_bytes(buf[..4].try_into().unwrap()) as f64),
            8 => json!(f64::from_le_bytes(buf)),
            _ => json!(unsigned),
        },
        Some("pointer") => json!(format!("0x{unsigned:x}")),
        _ => json!(unsigned),
    })
}

/// Execute read recipes. Per-target errors land in the result list.
pub fn read_recipes(
    mem: &dyn MemoryAccess,
    recipes: &[Recipe],
    slide: i64,
) -> Result<Vec<ReadResult>, CommandError> {
    validate(recipes)?;
    Ok(recipes
        .iter()
        .map(|recipe| read_one(mem, recipe, slide))
        .collect())
}

fn read_one(mem: &dyn MemoryAccess, recipe: &Recipe, slide: i64) -> ReadResult {
    let addr = match resolve_address(mem, recipe, slide) {
        Ok(addr) => addr,
        Err(err) => return ReadResult::error(&recipe.label, err.to_string()),
    };

    if recipe.is_struct {
        let mut fields = BTreeMap::new();
        for field in &recipe.fields {
            let value = read_scalar(
                mem,
                addr.wrapping_add(field.offset),
                field.size,
                field.type_kind.as_deref(),
            )
            .unwrap_or_else(|err| json!(format!("<{err}>")));
            fields.insert(field.name.clone(), value);
        }
        return ReadResult {
            label: recipe.label.clone(),
            value: None,
            fields: Some(fields),
            error: None,
            is_bytes: false,
        };
    }

    if recipe.type_kind.as_deref() == Some("bytes") {
        let len = (recipe.size as usize).max(1).min(MAX_BYTES_READ);
        let mut buf = vec![0u8; len];
        return match mem.read(addr, &mut buf) {
            Ok(()) => {
                let hex: String = buf.iter().map(|b| format!("{b:02x}")).collect();
                ReadResult {
                    label: recipe.label.clone(),
                    value: Some(json!(hex)),
                    fields: None,
                    error: None,
                    is_bytes: true,
                }
            }
            Err(err) => ReadResult::error(&recipe.label, err.to_string()),
        };
    }

    match read_scalar(mem, addr, recipe.size, recipe.type_kind.as_deref()) {
        Ok(value) => ReadResult::value(&recipe.label, value),
        Err(err) => ReadResult::error(&recipe.label, err.to_string()),
    }
}

/// Execute write recipes. Natural-size single stores only; no multi-word
/// atomicity.
pub fn write_recipes(
    mem: &dyn MemoryAccess,
    recipes: &[Recipe],
    slide: i64,
) -> Result<Vec<ReadResult>, CommandError> {
    validate(recipes)?;
    Ok(recipes
        .iter()
        .map(|recipe| write_one(mem, recipe, slide))
        .collect())
}

fn write_one(mem: &dyn MemoryAccess, recipe: &Recipe, slide: i64) -> ReadResult {
    let addr = match resolve_address(mem, recipe, slide) {
        Ok(addr) => addr,
        Err(err) => return ReadResult::error(&recipe.label, err.to_string()),
    };
    if addr % recipe.size.max(1) as u64 != 0 {
        return ReadResult::error(
            &recipe.label,
            MemoryError::InvalidAlignment {
                addr,
                size: recipe.size,
            }
            .to_string(),
        );
    }

    let raw = match &recipe.value {
        Some(Value::Number(n)) => {
            if let Some(v) = n.as_u64() {
                v
            } else if let Some(v) = n.as_i64() {
                v as u64
            } else {
                return ReadResult::error(&recipe.label, "non-integral write value");
            }
        }
        Some(Value::String(s)) => match parse_hex_addr(s) {
            Ok(v) => v,
            Err(_) => return ReadResult::error(&recipe.label, "unparsable write value"),
        },
        _ => return ReadResult::error(&recipe.label, "missing write value"),
    };

    let bytes = raw.to_le_bytes();
    match mem.write(addr, &bytes[..recipe.size as usize]) {
        Ok(()) => ReadResult::value(&recipe.label, json!(raw)),
        Err(err) => ReadResult::error(&recipe.label, err.to_string()),
    }
}

/// An active poll. The agent's tick loop drives it; a newly installed poll
/// simply replaces the previous one, which is the cancellation contract.
pub struct PollState {
    pub recipes: Vec<Recipe>,
    pub slide: i64,
    interval: Duration,
    deadline: Instant,
    next_due: Instant,
}

impl PollState {
    pub fn new(
        spec: PollSpec,
        recipes: Vec<Recipe>,
        slide: i64,
        now: Instant,
    ) -> Result<Self, CommandError> {
        if !POLL_INTERVAL_MS.contains(&spec.interval_ms) {
            return Err(CommandError::validation(format!(
                "poll interval {}ms outside [50, 5000]",
                spec.interval_ms
            )));
        }
        if !POLL_DURATION_MS.contains(&spec.duration_ms) {
            return Err(CommandError::validation(format!(
                "poll duration {}ms outside [100, 30000]",
                spec.duration_ms
            )));
        }
        validate(&recipes)?;
        let interval = Duration::from_millis(spec.interval_ms);
        Ok(Self {
            recipes,
            slide,
            interval,
            deadline: now + Duration::from_millis(spec.duration_ms),
            next_due: now + interval,
        })
    }

    /// True once per elapsed interval.
    pub fn due(&mut self, now: Instant) -> bool {
        if now >= self.next_due {
            self.next_due += self.interval;
            true
        } else {
            false
        }
    }

    pub fn expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }
}

/// Snapshot data for one poll tick: label → value/fields/error.
pub fn snapshot_data(
    mem: &dyn MemoryAccess,
    recipes: &[Recipe],
    slide: i64,
) -> BTreeMap<String, Value> {
    recipes
        .iter()
        .map(|recipe| {
            let result = read_one(mem, recipe, slide);
            let value = if let Some(err) = result.error {
                json!(format!("<{err}>"))
            } else if let Some(fields) = result.fields {
                json!(fields)
            } else {
                result.value.unwrap_or(Value::Null)
            };
            (result.label, value)
        })
        .collect()
}
