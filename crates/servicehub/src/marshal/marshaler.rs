//! Connection-scoped object marshaler

use super::proxy::MarshaledProxy;
use super::record::{
    async_alias, invoke_method_name, MarshaledObjectRecord, ReleaseNotification,
    MARSHALED_REAL_OBJECT, MARSHALED_RETURNED_PROXY, RELEASE_METHOD,
};
use super::tables::{ExportEntry, ExportTable, ImportTable};
use hubrpc::{
    arg, handler, MarshalLifetime, MarshalableTarget, ObjectProxy, RequestId, RpcConnection,
    RpcError, RpcValue, ValueMarshaler,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::any::Any;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

/// Passes objects by reference over one connection
///
/// Installed on a connection with [`ObjectMarshaler::install`]; owns the
/// connection's export and import tables and tears both down when the
/// connection closes.
pub struct ObjectMarshaler {
    connection_id: u64,
    self_ref: Weak<ObjectMarshaler>,
    connection: Weak<RpcConnection>,
    next_handle: AtomicI64,
    exports: Mutex<ExportTable>,
    imports: Mutex<ImportTable>,
}

impl ObjectMarshaler {
    /// Install a marshaler on `connection` and expose the release method
    pub fn install(connection: &Arc<RpcConnection>) -> Arc<Self> {
        let marshaler = Arc::new_cyclic(|self_ref| Self {
            connection_id: connection.id(),
            self_ref: self_ref.clone(),
            connection: Arc::downgrade(connection),
            next_handle: AtomicI64::new(1),
            exports: Mutex::new(ExportTable::default()),
            imports: Mutex::new(ImportTable::default()),
        });

        let weak = Arc::downgrade(&marshaler);
        connection.add_local_method(
            RELEASE_METHOD,
            handler(move |args: Vec<RpcValue>| {
                let weak = weak.clone();
                async move {
                    let release: ReleaseNotification = arg(&args, 0).deserialize()?;
                    if let Some(marshaler) = weak.upgrade() {
                        marshaler.on_release(release);
                    }
                    Ok(RpcValue::null())
                }
            }),
        );
        connection.set_marshaler(Arc::clone(&marshaler) as Arc<dyn ValueMarshaler>);
        marshaler
    }

    /// The marshaler installed on `connection`, if it is one of these
    pub fn for_connection(connection: &RpcConnection) -> Option<Arc<Self>> {
        connection.marshaler()?.into_any().downcast::<Self>().ok()
    }

    /// Number of objects currently exported
    pub fn export_count(&self) -> usize {
        self.exports.lock().len()
    }

    /// Number of live imported proxies
    pub fn import_count(&self) -> usize {
        self.imports.lock().len()
    }

    /// Whether `handle` is currently exported
    pub fn is_exported(&self, handle: i64) -> bool {
        self.exports.lock().lookup(handle).is_some()
    }

    /// Handle under which `target` is exported, if it is
    pub fn handle_of(&self, target: &Arc<hubrpc::LocalTarget>) -> Option<i64> {
        self.exports.lock().handle_of(target)
    }

    /// Withdraw an exported object
    ///
    /// Runs its disposer and tells the peer so its proxy stops working.
    pub fn release_export(&self, handle: i64) -> bool {
        let Some(entry) = self.exports.lock().remove(handle) else {
            return false;
        };
        let connection = self.connection.upgrade();
        dispose_export(entry, connection.as_deref());

        if let Some(connection) = connection {
            let release = ReleaseNotification {
                handle,
                owned_by_sender: true,
            };
            let sent = RpcValue::from_serialize(&release)
                .and_then(|arg| connection.notify(RELEASE_METHOD, vec![arg]));
            if let Err(e) = sent {
                debug!("Withdrawal of marshaled object {} not sent: {}", handle, e);
            }
        }
        true
    }

    pub(crate) fn forget_import(&self, handle: i64) {
        self.imports.lock().remove(handle);
    }

    fn on_release(&self, release: ReleaseNotification) {
        if release.owned_by_sender {
            // The peer withdrew an object we imported
            if let Some(proxy) = self.imports.lock().remove(release.handle) {
                proxy.sever();
                debug!("Peer withdrew marshaled object {}", release.handle);
            }
            return;
        }

        let entry = self.exports.lock().remove(release.handle);
        match entry {
            Some(entry) => {
                debug!("Peer released marshaled object {}", release.handle);
                dispose_export(entry, self.connection.upgrade().as_deref());
            }
            None => debug!("Release of unknown marshaled object {}", release.handle),
        }
    }

    fn export(
        &self,
        connection: &Arc<RpcConnection>,
        object: MarshalableTarget,
        call: Option<RequestId>,
    ) -> hubrpc::Result<Value> {
        if object.lifetime == MarshalLifetime::Call {
            return Err(RpcError::NotMarshalable(format!(
                "{}: call-scoped marshaled objects are not supported",
                object.target.name()
            )));
        }

        let mut exports = self.exports.lock();
        let handle = match exports.handle_of(&object.target) {
            Some(handle) => handle,
            None => {
                let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
                let mut method_names = Vec::new();
                for method in object.target.method_names() {
                    for exposed in [method.to_string(), async_alias(method)] {
                        let wire_name = invoke_method_name(handle, &exposed);
                        let target = Arc::clone(&object.target);
                        let method = method.to_string();
                        connection.add_local_method(
                            wire_name.clone(),
                            handler(move |args| {
                                let target = Arc::clone(&target);
                                let method = method.clone();
                                async move { target.invoke(&method, args).await }
                            }),
                        );
                        method_names.push(wire_name);
                    }
                }
                exports.insert(ExportEntry {
                    handle,
                    target: Arc::clone(&object.target),
                    method_names,
                    optional_interfaces: object.optional_interfaces.clone(),
                    delivered: false,
                });
                debug!(
                    "Exported {} as marshaled object {} on connection {}",
                    object.target.name(),
                    handle,
                    self.connection_id
                );
                handle
            }
        };
        if let Some(call) = call {
            exports.track_call(call, handle);
        }
        drop(exports);

        MarshaledObjectRecord::real_object(handle, object.lifetime, &object.optional_interfaces)
            .to_value()
    }

    /// Convert an inbound value, noting handles imported for the first time
    fn import_value(
        &self,
        connection: &Arc<RpcConnection>,
        value: Value,
        fresh: &mut Vec<i64>,
    ) -> hubrpc::Result<RpcValue> {
        if !MarshaledObjectRecord::is_record(&value) {
            return Ok(RpcValue::Json(value));
        }
        let record = MarshaledObjectRecord::from_value(value)?;
        self.import(connection, record, fresh)
    }

    fn import(
        &self,
        connection: &Arc<RpcConnection>,
        record: MarshaledObjectRecord,
        fresh: &mut Vec<i64>,
    ) -> hubrpc::Result<RpcValue> {
        match record.marshaled {
            MARSHALED_REAL_OBJECT => {
                if record.lifetime()? == MarshalLifetime::Call {
                    return Err(RpcError::Marshaling(format!(
                        "marshaled object {} has call-scoped lifetime, which is not supported",
                        record.handle
                    )));
                }
                let mut imports = self.imports.lock();
                if let Some(existing) = imports.lookup(record.handle) {
                    return Ok(RpcValue::Proxy(existing));
                }
                let proxy = Arc::new(MarshaledProxy::new(
                    record.handle,
                    record.optional_interfaces.unwrap_or_default(),
                    connection,
                    self.self_ref.clone(),
                ));
                imports.insert(Arc::clone(&proxy));
                fresh.push(record.handle);
                debug!(
                    "Imported marshaled object {} on connection {}",
                    record.handle, self.connection_id
                );
                Ok(RpcValue::Proxy(proxy))
            }
            MARSHALED_RETURNED_PROXY => {
                let exports = self.exports.lock();
                let entry = exports.lookup(record.handle).ok_or_else(|| {
                    RpcError::Marshaling(format!(
                        "peer returned unknown marshaled object {}",
                        record.handle
                    ))
                })?;
                Ok(RpcValue::Target(MarshalableTarget {
                    target: Arc::clone(&entry.target),
                    lifetime: MarshalLifetime::Explicit,
                    optional_interfaces: entry.optional_interfaces.clone(),
                }))
            }
            other => Err(RpcError::Marshaling(format!(
                "unknown marshaled kind {} for handle {}",
                other, record.handle
            ))),
        }
    }
}

/// Unregister an export and dispose the object behind it
fn dispose_export(entry: ExportEntry, connection: Option<&RpcConnection>) {
    unregister_export(&entry, connection);
    if entry.target.supports_disposal() {
        entry.target.dispose();
    }
}

fn unregister_export(entry: &ExportEntry, connection: Option<&RpcConnection>) {
    if let Some(connection) = connection {
        for name in &entry.method_names {
            connection.remove_local_method(name);
        }
    }
}

impl ValueMarshaler for ObjectMarshaler {
    fn to_wire(
        &self,
        connection: &Arc<RpcConnection>,
        value: RpcValue,
        call: Option<RequestId>,
    ) -> hubrpc::Result<Value> {
        match value {
            RpcValue::Json(v) => Ok(v),
            RpcValue::Target(object) => self.export(connection, object, call),
            RpcValue::Proxy(proxy) => {
                let Some(imported) = proxy.as_any().downcast_ref::<MarshaledProxy>() else {
                    return Err(RpcError::NotMarshalable(
                        "only local objects and proxies imported on this connection can be marshaled"
                            .to_string(),
                    ));
                };
                if imported.connection_id() != self.connection_id {
                    return Err(RpcError::NotMarshalable(format!(
                        "marshaled object {} belongs to connection {}",
                        imported.handle(),
                        imported.connection_id()
                    )));
                }
                if imported.is_disposed() {
                    return Err(RpcError::ObjectDisposed(format!(
                        "marshaled object {}",
                        imported.handle()
                    )));
                }
                MarshaledObjectRecord::returned_proxy(imported.handle()).to_value()
            }
        }
    }

    fn from_wire(&self, connection: &Arc<RpcConnection>, value: Value) -> hubrpc::Result<RpcValue> {
        self.import_value(connection, value, &mut Vec::new())
    }

    fn args_from_wire(
        &self,
        connection: &Arc<RpcConnection>,
        params: Vec<Value>,
    ) -> hubrpc::Result<Vec<RpcValue>> {
        let mut fresh = Vec::new();
        let mut args = Vec::with_capacity(params.len());
        for param in params {
            match self.import_value(connection, param, &mut fresh) {
                Ok(arg) => args.push(arg),
                Err(e) => {
                    // The peer learns of the failure from the error response
                    // and withdraws these objects itself
                    let mut imports = self.imports.lock();
                    for handle in fresh {
                        if let Some(proxy) = imports.remove(handle) {
                            proxy.sever();
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(args)
    }

    fn call_completed(&self, _connection: &Arc<RpcConnection>, call: RequestId) {
        self.exports.lock().call_delivered(call);
    }

    fn call_failed(&self, connection: &Arc<RpcConnection>, call: RequestId) {
        let orphans = self.exports.lock().call_failed(call);
        for entry in orphans {
            // The caller still owns the object; only the registration goes
            unregister_export(&entry, Some(connection.as_ref()));
            debug!(
                "Unregistered marshaled object {} after call {} failed",
                entry.handle, call
            );
        }
    }

    fn connection_closed(&self, connection: &RpcConnection) {
        let exports = self.exports.lock().drain();
        let imports = self.imports.lock().drain();
        if !exports.is_empty() || !imports.is_empty() {
            debug!(
                "Connection {} closed: dropping {} exports and {} imports",
                self.connection_id,
                exports.len(),
                imports.len()
            );
        }
        for entry in exports {
            dispose_export(entry, Some(connection));
        }
        for proxy in imports {
            proxy.sever();
        }
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl std::fmt::Debug for ObjectMarshaler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectMarshaler")
            .field("connection_id", &self.connection_id)
            .field("exports", &self.export_count())
            .field("imports", &self.import_count())
            .finish()
    }
}
