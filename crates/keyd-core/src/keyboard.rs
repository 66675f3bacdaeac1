// Keyd Keyboard Interpreter
// Per-configuration state machine: layers, oneshot, overload

use std::collections::HashMap;
use std::time::Instant;

use smallvec::SmallVec;

use crate::config::{self, Action, Config, ConfigError};

/// Key output callback; receives an internal code and pressed state.
pub type EmitFn = Box<dyn FnMut(u8, bool)>;

/// Layer notification callback; receives the layer name and whether it
/// just became active.
pub type LayerFn = Box<dyn FnMut(&str, bool)>;

#[derive(Debug, thiserror::Error)]
pub enum KeyboardError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("unknown layer '{0}'")]
    UnknownLayer(String),

    #[error("malformed binding '{0}' (expected [layer.]key = action)")]
    BadExpression(String),
}

struct Layer {
    name: String,
    bindings: HashMap<u8, Action>,
}

/// What a pressed physical key did, so its release can undo it.
enum Held {
    /// Release emits this output code.
    Emitted(u8),
    /// Release pops this layer off the stack.
    Layer(usize),
    /// Release resolves a still-pending overload to its tap key.
    OverloadPending,
    /// Release does nothing (oneshot triggers).
    Nothing,
}

struct Oneshot {
    layer: usize,
    deadline: Option<Instant>,
}

struct PendingOverload {
    code: u8,
    layer: usize,
    tap: u8,
    deadline: Instant,
}

/// A keyboard state machine built from one configuration.
///
/// Key output and layer notifications flow through the two callbacks
/// supplied at construction; the keyboard knows nothing about the virtual
/// device or the IPC layer behind them.
pub struct Keyboard {
    layers: Vec<Layer>,
    emit: EmitFn,
    on_layer: LayerFn,
    overload_ms: u64,
    oneshot_ms: u64,

    /// Held layer indices, most recent last.
    stack: SmallVec<[usize; 4]>,
    held: HashMap<u8, Held>,
    oneshot: Option<Oneshot>,
    pending: Option<PendingOverload>,
}

impl Keyboard {
    pub fn new(config: &Config, emit: EmitFn, on_layer: LayerFn) -> Self {
        let layers = config
            .layers
            .iter()
            .map(|(name, bindings)| Layer {
                name: name.clone(),
                bindings: bindings.clone(),
            })
            .collect();

        Self {
            layers,
            emit,
            on_layer,
            overload_ms: config.overload_ms,
            oneshot_ms: config.oneshot_ms,
            stack: SmallVec::new(),
            held: HashMap::new(),
            oneshot: None,
            pending: None,
        }
    }

    /// Feed one key event; code 0 is a pure tick that only advances timers.
    ///
    /// Returns the number of milliseconds until the keyboard next needs a
    /// tick, or 0 if no deadline is pending.
    pub fn process_key_event(&mut self, code: u8, pressed: bool) -> u64 {
        let now = Instant::now();
        self.advance_timers(now);

        if code == 0 {
            return self.next_timeout(now);
        }

        if pressed {
            self.press(code);
        } else {
            self.release(code);
        }

        self.next_timeout(now)
    }

    /// Evaluate a runtime binding expression: `key = action` against the
    /// main layer, or `layer.key = action` against a named layer.
    pub fn eval(&mut self, expr: &str) -> Result<(), KeyboardError> {
        let (lhs, rhs) = expr
            .split_once('=')
            .ok_or_else(|| KeyboardError::BadExpression(expr.to_string()))?;

        let lhs = lhs.trim();
        let (layer_name, key_name) = match lhs.split_once('.') {
            Some((layer, key)) => (layer.trim(), key.trim()),
            None => ("main", lhs),
        };

        let code = crate::key::lookup_keycode(key_name)
            .ok_or_else(|| ConfigError::UnknownKey(key_name.to_string()))?;
        let action = config::parse_action(rhs)?;

        if let Action::Layer(l) | Action::Oneshot(l) = &action {
            if self.layer_index(l).is_none() {
                return Err(KeyboardError::UnknownLayer(l.clone()));
            }
        }
        if let Action::Overload { layer, .. } = &action {
            if self.layer_index(layer).is_none() {
                return Err(KeyboardError::UnknownLayer(layer.clone()));
            }
        }

        let idx = self
            .layer_index(layer_name)
            .ok_or_else(|| KeyboardError::UnknownLayer(layer_name.to_string()))?;
        self.layers[idx].bindings.insert(code, action);
        Ok(())
    }

    fn layer_index(&self, name: &str) -> Option<usize> {
        self.layers.iter().position(|l| l.name == name)
    }

    fn announce(&mut self, idx: usize, active: bool) {
        (self.on_layer)(&self.layers[idx].name, active);
    }

    fn emit(&mut self, code: u8, pressed: bool) {
        (self.emit)(code, pressed);
    }

    /// Commit or expire pending deadlines that `now` has passed.
    fn advance_timers(&mut self, now: Instant) {
        if let Some(p) = &self.pending {
            if now >= p.deadline {
                self.commit_overload();
            }
        }

        let decayed = matches!(
            &self.oneshot,
            Some(Oneshot {
                deadline: Some(d), ..
            }) if now >= *d
        );
        if decayed {
            self.consume_oneshot();
        }
    }

    fn next_timeout(&self, now: Instant) -> u64 {
        let mut next: Option<Instant> = self.pending.as_ref().map(|p| p.deadline);
        if let Some(Oneshot {
            deadline: Some(d), ..
        }) = &self.oneshot
        {
            if next.map_or(true, |n| *d < n) {
                next = Some(*d);
            }
        }

        match next {
            // A deadline that is already due still needs a tick to fire.
            Some(d) => (d.saturating_duration_since(now).as_millis() as u64).max(1),
            None => 0,
        }
    }

    /// Turn a still-pending overload into its held layer.
    fn commit_overload(&mut self) {
        if let Some(p) = self.pending.take() {
            self.stack.push(p.layer);
            self.held.insert(p.code, Held::Layer(p.layer));
            self.announce(p.layer, true);
        }
    }

    fn consume_oneshot(&mut self) {
        if let Some(o) = self.oneshot.take() {
            self.announce(o.layer, false);
        }
    }

    /// Find the action for a pressed code; consumes an armed oneshot.
    fn resolve(&mut self, code: u8) -> Option<Action> {
        if let Some(o) = &self.oneshot {
            let layer = o.layer;
            let action = self.layers[layer].bindings.get(&code).cloned();
            self.consume_oneshot();
            if let Some(action) = action {
                return Some(action);
            }
        }

        for &idx in self.stack.iter().rev() {
            if let Some(action) = self.layers[idx].bindings.get(&code) {
                return Some(action.clone());
            }
        }

        self.layers[0].bindings.get(&code).cloned()
    }

    fn press(&mut self, code: u8) {
        // A second key interposed while an overload is pending resolves it
        // as a hold before the new key is interpreted.
        if let Some(p) = &self.pending {
            if p.code != code {
                self.commit_overload();
            } else {
                return;
            }
        }

        match self.resolve(code) {
            None => {
                self.emit(code, true);
                self.held.insert(code, Held::Emitted(code));
            }
            Some(Action::Key(out)) => {
                self.emit(out, true);
                self.held.insert(code, Held::Emitted(out));
            }
            Some(Action::Layer(name)) => {
                let Some(idx) = self.layer_index(&name) else {
                    log::warn!("binding references undefined layer {}", name);
                    return;
                };
                self.stack.push(idx);
                self.held.insert(code, Held::Layer(idx));
                self.announce(idx, true);
            }
            Some(Action::Oneshot(name)) => {
                let Some(idx) = self.layer_index(&name) else {
                    log::warn!("binding references undefined layer {}", name);
                    return;
                };
                if self.oneshot.as_ref().map(|o| o.layer) == Some(idx) {
                    // Re-arming the same layer just refreshes its decay.
                    if let Some(o) = &mut self.oneshot {
                        o.deadline = oneshot_deadline(self.oneshot_ms);
                    }
                } else {
                    self.consume_oneshot();
                    self.oneshot = Some(Oneshot {
                        layer: idx,
                        deadline: oneshot_deadline(self.oneshot_ms),
                    });
                    self.announce(idx, true);
                }
                self.held.insert(code, Held::Nothing);
            }
            Some(Action::Overload { layer, tap }) => {
                let Some(idx) = self.layer_index(&layer) else {
                    log::warn!("binding references undefined layer {}", layer);
                    return;
                };
                self.pending = Some(PendingOverload {
                    code,
                    layer: idx,
                    tap,
                    deadline: Instant::now() + std::time::Duration::from_millis(self.overload_ms),
                });
                self.held.insert(code, Held::OverloadPending);
            }
        }
    }

    fn release(&mut self, code: u8) {
        match self.held.remove(&code) {
            Some(Held::Emitted(out)) => self.emit(out, false),
            Some(Held::Layer(idx)) => {
                if let Some(pos) = self.stack.iter().rposition(|&l| l == idx) {
                    self.stack.remove(pos);
                }
                self.announce(idx, false);
            }
            Some(Held::OverloadPending) => {
                if let Some(p) = self.pending.take() {
                    if p.code == code {
                        self.emit(p.tap, true);
                        self.emit(p.tap, false);
                    } else {
                        self.pending = Some(p);
                    }
                }
            }
            Some(Held::Nothing) => {}
            None => self.emit(code, false),
        }
    }
}

fn oneshot_deadline(ms: u64) -> Option<Instant> {
    (ms > 0).then(|| Instant::now() + std::time::Duration::from_millis(ms))
}
