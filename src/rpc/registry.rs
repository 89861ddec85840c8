//! Bounded registries for functions, variables, files, and subscriptions.
//!
//! Capacity applies at registration time: a full registry rejects new names
//! with `false` and stays unchanged, while re-registration of an existing
//! name always overwrites.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::core::{
    CallbackError, MAX_FILES, MAX_FUNCTIONS, MAX_NAME_LENGTH, MAX_SUBSCRIPTIONS, MAX_VARIABLES,
};
use crate::rpc::value::{VariableKind, VariableValue};
use crate::session::events::CloudEvent;

/// Boxed future returned by user callbacks.
pub type CallbackFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Arguments of an inbound function call.
#[derive(Debug, Clone)]
pub struct FunctionCall {
    /// Raw argument string (Uri-Query\[0\]).
    pub args: String,
    /// Caller identifier (Uri-Query\[1\]), when supplied.
    pub caller: Option<String>,
}

/// User-supplied function producer; yields the 32-bit return value.
pub type FunctionCallback =
    Arc<dyn Fn(FunctionCall) -> CallbackFuture<Result<i32, CallbackError>> + Send + Sync>;

/// User-supplied variable producer; receives the full variable path.
pub type VariableCallback =
    Arc<dyn Fn(String) -> CallbackFuture<Result<VariableValue, CallbackError>> + Send + Sync>;

/// User-supplied file producer; receives the requested name.
pub type FileCallback =
    Arc<dyn Fn(String) -> CallbackFuture<Result<Vec<u8>, CallbackError>> + Send + Sync>;

/// Handler invoked for each matching cloud event.
pub type SubscriptionHandler = Arc<dyn Fn(CloudEvent) + Send + Sync>;

/// Registration flags of a function.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FunctionFlags {
    /// Only identifiers in the owners list may invoke the function.
    pub owner_only: bool,
}

impl FunctionFlags {
    /// Flags restricting invocation to owners.
    pub fn owner_only() -> Self {
        Self { owner_only: true }
    }
}

/// A registered function.
#[derive(Clone)]
pub struct FunctionEntry {
    /// Registration flags.
    pub flags: FunctionFlags,
    /// Producer callback.
    pub callback: FunctionCallback,
}

/// A registered variable.
#[derive(Clone)]
pub struct VariableEntry {
    /// Declared wire type.
    pub kind: VariableKind,
    /// Producer callback.
    pub callback: VariableCallback,
}

/// A registered file.
#[derive(Clone)]
pub struct FileEntry {
    /// Advertised MIME type.
    pub mime_type: String,
    /// Producer callback.
    pub callback: FileCallback,
}

/// Delivery scope of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubscriptionScope {
    /// Events from every device.
    #[default]
    AllDevices,
    /// Only events from the caller's own devices.
    MyDevices,
}

/// A registered subscription.
#[derive(Clone)]
pub struct SubscriptionEntry {
    /// Event-name prefix.
    pub name: String,
    /// Delivery scope.
    pub scope: SubscriptionScope,
    /// Handler for matching events.
    pub handler: SubscriptionHandler,
}

/// All device registrations plus the cloud-asserted owners list.
#[derive(Default)]
pub struct Registries {
    functions: HashMap<String, FunctionEntry>,
    variables: HashMap<String, VariableEntry>,
    files: HashMap<String, FileEntry>,
    subscriptions: Vec<SubscriptionEntry>,
    owners: Vec<String>,
}

impl Registries {
    /// Create empty registries.
    pub fn new() -> Self {
        Self::default()
    }

    fn name_ok(name: &str) -> bool {
        !name.is_empty() && name.len() <= MAX_NAME_LENGTH
    }

    /// Register a function. Returns false when the name is invalid or the
    /// registry is full.
    pub fn register_function(
        &mut self,
        name: &str,
        flags: FunctionFlags,
        callback: FunctionCallback,
    ) -> bool {
        if !Self::name_ok(name) {
            return false;
        }
        if !self.functions.contains_key(name) && self.functions.len() >= MAX_FUNCTIONS {
            return false;
        }
        self.functions
            .insert(name.to_string(), FunctionEntry { flags, callback });
        true
    }

    /// Register a variable under a declared type.
    pub fn register_variable(
        &mut self,
        name: &str,
        kind: VariableKind,
        callback: VariableCallback,
    ) -> bool {
        if !Self::name_ok(name) {
            return false;
        }
        if !self.variables.contains_key(name) && self.variables.len() >= MAX_VARIABLES {
            return false;
        }
        self.variables
            .insert(name.to_string(), VariableEntry { kind, callback });
        true
    }

    /// Register a transferable file.
    pub fn register_file(&mut self, name: &str, mime_type: &str, callback: FileCallback) -> bool {
        if !Self::name_ok(name) {
            return false;
        }
        if !self.files.contains_key(name) && self.files.len() >= MAX_FILES {
            return false;
        }
        self.files.insert(
            name.to_string(),
            FileEntry {
                mime_type: mime_type.to_string(),
                callback,
            },
        );
        true
    }

    /// Register a subscription prefix; same-name registration overwrites.
    pub fn register_subscription(
        &mut self,
        name: &str,
        scope: SubscriptionScope,
        handler: SubscriptionHandler,
    ) -> bool {
        if !Self::name_ok(name) {
            return false;
        }
        if let Some(existing) = self.subscriptions.iter_mut().find(|s| s.name == name) {
            existing.scope = scope;
            existing.handler = handler;
            return true;
        }
        if self.subscriptions.len() >= MAX_SUBSCRIPTIONS {
            return false;
        }
        self.subscriptions.push(SubscriptionEntry {
            name: name.to_string(),
            scope,
            handler,
        });
        true
    }

    /// Remove a subscription by its registered name.
    pub fn unsubscribe(&mut self, name: &str) -> bool {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|s| s.name != name);
        self.subscriptions.len() != before
    }

    /// Look up a function.
    pub fn function(&self, name: &str) -> Option<FunctionEntry> {
        self.functions.get(name).cloned()
    }

    /// Look up a variable.
    pub fn variable(&self, name: &str) -> Option<VariableEntry> {
        self.variables.get(name).cloned()
    }

    /// Look up a file.
    pub fn file(&self, name: &str) -> Option<FileEntry> {
        self.files.get(name).cloned()
    }

    /// Snapshot of the registered subscriptions, in registration order.
    pub fn subscriptions(&self) -> Vec<SubscriptionEntry> {
        self.subscriptions.clone()
    }

    /// Registered function names, for the descriptor.
    pub fn function_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.functions.keys().cloned().collect();
        names.sort();
        names
    }

    /// Registered variables and their declared types, for the descriptor.
    pub fn variable_kinds(&self) -> Vec<(String, VariableKind)> {
        let mut kinds: Vec<_> = self
            .variables
            .iter()
            .map(|(name, entry)| (name.clone(), entry.kind))
            .collect();
        kinds.sort_by(|a, b| a.0.cmp(&b.0));
        kinds
    }

    /// Registered files and their MIME types, for the descriptor.
    pub fn file_mimes(&self) -> Vec<(String, String)> {
        let mut mimes: Vec<_> = self
            .files
            .iter()
            .map(|(name, entry)| (name.clone(), entry.mime_type.clone()))
            .collect();
        mimes.sort_by(|a, b| a.0.cmp(&b.0));
        mimes
    }

    /// Replace the owners list from an inbound system event.
    pub fn set_owners(&mut self, owners: Vec<String>) {
        self.owners = owners;
    }

    /// Whether the identifier is an asserted owner.
    pub fn is_owner(&self, caller: &str) -> bool {
        self.owners.iter().any(|o| o == caller)
    }
}
