use super::*;

/// Identity of a function registered in the page's function table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FnId(pub(crate) usize);

/// Objects a guest can hold a reference to. The same references double as binding
/// targets for rebound functions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectRef {
    /// The guest-facing window of an app.
    VirtualWindow(String),
    /// The guest-facing document of an app.
    VirtualDocument(String),
    /// The guest-facing location of an app.
    VirtualLocation(String),
    /// The real window of an app's execution context.
    ContextWindow(String),
    /// The real document of an app's execution context.
    ContextDocument(String),
    /// The `provide` object injected into an app.
    Provide(String),
    /// Props passed to an app.
    Props(String),
    /// The event bus of an app.
    Bus(String),
    /// The sandbox marker object of an app.
    SandboxMarker(String),
    HostWindow,
    HostDocument,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum GlobalValue {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
    Node(NodeId),
    Nodes(Vec<NodeId>),
    Function(FnId),
    Object(ObjectRef),
}

impl GlobalValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(value) => Some(value.as_str()),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_node(&self) -> Option<NodeId> {
        match self {
            Self::Node(node) => Some(*node),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<FnId> {
        match self {
            Self::Function(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Self::Object(object) => Some(object),
            _ => None,
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Self::Undefined)
    }

    pub fn truthy(&self) -> bool {
        match self {
            Self::Undefined | Self::Null => false,
            Self::Bool(value) => *value,
            Self::Number(value) => *value != 0.0 && !value.is_nan(),
            Self::Str(value) => !value.is_empty(),
            _ => true,
        }
    }

    /// String conversion used when a guest passes a value where text is expected.
    pub fn as_text(&self) -> String {
        match self {
            Self::Undefined => "undefined".into(),
            Self::Null => "null".into(),
            Self::Bool(value) => value.to_string(),
            Self::Number(value) => {
                if value.fract() == 0.0 && value.is_finite() {
                    format!("{}", *value as i64)
                } else {
                    value.to_string()
                }
            }
            Self::Str(value) => value.clone(),
            Self::Node(_) | Self::Nodes(_) | Self::Object(_) => "[object]".into(),
            Self::Function(_) => "function".into(),
        }
    }
}

impl From<&str> for GlobalValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for GlobalValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<bool> for GlobalValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<f64> for GlobalValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<i64> for GlobalValue {
    fn from(value: i64) -> Self {
        Self::Number(value as f64)
    }
}

impl From<NodeId> for GlobalValue {
    fn from(value: NodeId) -> Self {
        Self::Node(value)
    }
}

impl From<FnId> for GlobalValue {
    fn from(value: FnId) -> Self {
        Self::Function(value)
    }
}

/// Body of a native function. `scope.this()` reports the receiver the function was
/// bound to, if any.
pub type NativeFn = Rc<dyn Fn(&mut GuestScope<'_>, &[GlobalValue]) -> Result<GlobalValue>>;

#[derive(Clone)]
pub(crate) struct FunctionDef {
    pub(crate) name: String,
    pub(crate) body: NativeFn,
    pub(crate) bound_this: Option<ObjectRef>,
    pub(crate) target: Option<FnId>,
    pub(crate) constructable: bool,
    pub(crate) props: BTreeMap<String, GlobalValue>,
    /// App whose code defined the function; listeners dispatched from the host side run
    /// in this app's scope.
    pub(crate) owner: Option<String>,
}

/// Public view of a registered function.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionInfo {
    pub name: String,
    pub bound_this: Option<ObjectRef>,
    pub target: Option<FnId>,
    pub constructable: bool,
}

/// Every function the page knows, plus the per-target rebinding cache. Ids are never
/// reused; released entries are removed from the table.
#[derive(Default)]
pub(crate) struct FunctionTable {
    defs: HashMap<FnId, FunctionDef>,
    next_id: usize,
    bindings: HashMap<ObjectRef, HashMap<FnId, FnId>>,
}

impl FunctionTable {
    pub(crate) fn define(&mut self, name: &str, body: NativeFn, constructable: bool) -> FnId {
        self.define_owned(name, body, constructable, None)
    }

    pub(crate) fn define_owned(
        &mut self,
        name: &str,
        body: NativeFn,
        constructable: bool,
        owner: Option<&str>,
    ) -> FnId {
        self.insert(FunctionDef {
            name: name.to_string(),
            body,
            bound_this: None,
            target: None,
            constructable,
            props: BTreeMap::new(),
            owner: owner.map(ToOwned::to_owned),
        })
    }

    fn insert(&mut self, def: FunctionDef) -> FnId {
        let id = FnId(self.next_id);
        self.next_id += 1;
        self.defs.insert(id, def);
        id
    }

    pub(crate) fn len(&self) -> usize {
        self.defs.len()
    }

    pub(crate) fn get(&self, id: FnId) -> Result<&FunctionDef> {
        self.defs
            .get(&id)
            .ok_or_else(|| Error::ScriptRuntime(format!("unknown function #{}", id.0)))
    }

    pub(crate) fn info(&self, id: FnId) -> Option<FunctionInfo> {
        self.defs.get(&id).map(|def| FunctionInfo {
            name: def.name.clone(),
            bound_this: def.bound_this.clone(),
            target: def.target,
            constructable: def.constructable,
        })
    }

    pub(crate) fn owner(&self, id: FnId) -> Option<&str> {
        self.defs.get(&id).and_then(|def| def.owner.as_deref())
    }

    pub(crate) fn is_bound(&self, id: FnId) -> bool {
        self.defs.get(&id).is_some_and(|def| def.bound_this.is_some())
    }

    pub(crate) fn is_constructable(&self, id: FnId) -> bool {
        self.defs.get(&id).is_some_and(|def| def.constructable)
    }

    pub(crate) fn cached(&self, target: &ObjectRef, id: FnId) -> Option<FnId> {
        self.bindings.get(target)?.get(&id).copied()
    }

    /// Copy of `id` bound to `target`, created once per (target, function) pair. The copy
    /// inherits the own properties of the original at creation time.
    pub(crate) fn bound_for(&mut self, target: &ObjectRef, id: FnId) -> Result<FnId> {
        if let Some(existing) = self.cached(target, id) {
            return Ok(existing);
        }
        let original = self.get(id)?.clone();
        let bound = self.insert(FunctionDef {
            name: format!("bound {}", original.name),
            body: original.body,
            bound_this: Some(target.clone()),
            target: Some(id),
            constructable: false,
            props: original.props,
            owner: original.owner,
        });
        self.bindings
            .entry(target.clone())
            .or_default()
            .insert(id, bound);
        Ok(bound)
    }

    /// Records a function written by a guest so later reads return it as-is.
    pub(crate) fn track(&mut self, target: &ObjectRef, id: FnId) {
        if self.cached(target, id).is_some() {
            return;
        }
        self.bindings.entry(target.clone()).or_default().insert(id, id);
    }

    /// Forgets the rebinding cache of `target` and frees the bound copies it made.
    pub(crate) fn clear_target(&mut self, target: &ObjectRef) {
        let Some(cache) = self.bindings.remove(target) else {
            return;
        };
        for (original, bound) in cache {
            if bound != original {
                self.defs.remove(&bound);
            }
        }
    }

    /// Frees every function owned by `owner` except those in `keep`, and the cache
    /// entries that pointed at them.
    pub(crate) fn release_owner(&mut self, owner: &str, keep: &HashSet<FnId>) {
        self.defs.retain(|id, def| keep.contains(id) || def.owner.as_deref() != Some(owner));
        let defs = &self.defs;
        for cache in self.bindings.values_mut() {
            cache.retain(|original, bound| defs.contains_key(original) && defs.contains_key(bound));
        }
        self.bindings.retain(|_, cache| !cache.is_empty());
    }

    pub(crate) fn set_prop(&mut self, id: FnId, name: &str, value: GlobalValue) -> Result<()> {
        let def = self
            .defs
            .get_mut(&id)
            .ok_or_else(|| Error::ScriptRuntime(format!("unknown function #{}", id.0)))?;
        def.props.insert(name.to_string(), value);
        Ok(())
    }

    pub(crate) fn prop(&self, id: FnId, name: &str) -> GlobalValue {
        self.defs
            .get(&id)
            .and_then(|def| def.props.get(name).cloned())
            .unwrap_or_default()
    }
}

/// A named slot on a window-like object.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PropertySlot {
    pub(crate) value: GlobalValue,
    pub(crate) configurable: bool,
    pub(crate) writable: bool,
}

impl PropertySlot {
    pub(crate) fn plain(value: GlobalValue) -> Self {
        Self {
            value,
            configurable: true,
            writable: true,
        }
    }

    pub(crate) fn frozen(value: GlobalValue) -> Self {
        Self {
            value,
            configurable: false,
            writable: false,
        }
    }
}

pub(crate) fn arg_text(args: &[GlobalValue], index: usize) -> String {
    args.get(index).map(GlobalValue::as_text).unwrap_or_default()
}
