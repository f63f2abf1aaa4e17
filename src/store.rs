use crate::doc::Document;
use crate::mirror::{Mirror, MirrorOptions, StateSubscription, UpdateMeta};
use crate::schema::Schema;
use crate::value::Value;
use crate::Result;

/// Thin get/set/subscribe façade over a [`Mirror`].
///
/// The store funnels every write through the engine; callers never mutate
/// the state directly. Invalid updates are accepted with a log by default
/// here, unlike the engine's own strict default.
pub struct Store {
    mirror: Mirror,
}

impl Store {
    /// Opens a store over `doc` with the façade defaults.
    pub fn new(doc: Document, schema: Schema) -> Result<Self> {
        let options = MirrorOptions { throw_on_validation_error: false, ..Default::default() };
        Self::with_options(doc, schema, options)
    }

    /// Opens a store with explicit engine options.
    pub fn with_options(doc: Document, schema: Schema, options: MirrorOptions) -> Result<Self> {
        Ok(Self { mirror: Mirror::new(doc, schema, options)? })
    }

    /// Opens a store with an initial state overlay.
    pub fn with_initial_state(
        doc: Document,
        schema: Schema,
        options: MirrorOptions,
        initial: Value,
    ) -> Result<Self> {
        Ok(Self { mirror: Mirror::with_initial_state(doc, schema, options, Some(initial))? })
    }

    /// A snapshot of the current state.
    pub fn get_state(&self) -> Value {
        self.mirror.state()
    }

    /// Proposes a new state by mutating a draft of the current one.
    pub fn set_state(&self, updater: impl FnOnce(&mut Value)) -> Result<()> {
        self.mirror.set_state(updater)
    }

    /// [`Store::set_state`] with tags surfaced to subscribers.
    pub fn set_state_with_tags(
        &self,
        tags: impl IntoIterator<Item = String>,
        updater: impl FnOnce(&mut Value),
    ) -> Result<()> {
        self.mirror.set_state_with_tags(tags.into_iter().collect(), updater)
    }

    /// Overlays a partial mapping over the state's top level.
    pub fn merge_state(&self, partial: Value) -> Result<()> {
        self.mirror.merge_state(partial)
    }

    /// Registers a subscriber notified after every adopted update.
    pub fn subscribe(
        &self,
        cb: impl Fn(&Value, &UpdateMeta) + Send + Sync + 'static,
    ) -> StateSubscription {
        self.mirror.subscribe(cb)
    }

    /// Escape hatch to the mirrored document.
    pub fn document(&self) -> Document {
        self.mirror.document()
    }

    /// The underlying engine.
    pub fn mirror(&self) -> &Mirror {
        &self.mirror
    }
}
