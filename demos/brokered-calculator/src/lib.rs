//! Brokered calculator shared by the host and the client
//!
//! The host registers the calculator for the local machine and serves its
//! container through a remote broker relay. Clients reach it through any
//! [`servicehub::ServiceBroker`]: a view on an in-process container, or a
//! remote broker client connected to the host.

use std::sync::Arc;

use hubrpc::{arg, LocalTarget, ObjectProxy, ObjectProxyExt, RpcError, RpcValue};
use serde::{Deserialize, Serialize};
use serde_json::json;
use servicehub::{
    ContainerOptions, FromProxy, ServiceAudience, ServiceContainer, ServiceMoniker, ServiceProxy,
    ServiceRegistration, ServiceRpcDescriptor,
};
use tracing::info;

pub const CALCULATOR: &str = "calculator";
pub const DEFAULT_PIPE: &str = "servicehub-calculator";

/// The version clients ask for; the host registers every version
pub fn calculator_moniker() -> ServiceMoniker {
    ServiceMoniker::versioned(CALCULATOR, "1.0")
}

pub fn calculator_descriptor() -> ServiceRpcDescriptor {
    ServiceRpcDescriptor::new(calculator_moniker())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Division {
    pub quotient: i64,
    pub remainder: i64,
}

fn operands(args: &[RpcValue]) -> hubrpc::Result<(i64, i64)> {
    Ok((arg(args, 0).deserialize()?, arg(args, 1).deserialize()?))
}

/// A fresh calculator instance
pub fn calculator_service() -> Arc<LocalTarget> {
    LocalTarget::builder(CALCULATOR)
        .method("Add", |args| async move {
            let (a, b) = operands(&args)?;
            info!("Add({}, {}) = {}", a, b, a + b);
            Ok(RpcValue::from(json!(a + b)))
        })
        .method("Subtract", |args| async move {
            let (a, b) = operands(&args)?;
            info!("Subtract({}, {}) = {}", a, b, a - b);
            Ok(RpcValue::from(json!(a - b)))
        })
        .method("Multiply", |args| async move {
            let (a, b) = operands(&args)?;
            info!("Multiply({}, {}) = {}", a, b, a * b);
            Ok(RpcValue::from(json!(a * b)))
        })
        .method("Divide", |args| async move {
            let (a, b) = operands(&args)?;
            if b == 0 {
                return Err(RpcError::Invocation("division by zero".into()));
            }
            let result = Division {
                quotient: a / b,
                remainder: a % b,
            };
            info!("Divide({}, {}) = {:?}", a, b, result);
            RpcValue::from_serialize(&result)
        })
        .on_dispose(|| info!("Calculator instance disposed"))
        .build()
}

/// Container with the calculator registered for the local machine
pub fn host_container(name: &str) -> servicehub::Result<Arc<ServiceContainer>> {
    let container = ServiceContainer::with_options(ContainerOptions::named(name));
    container.register([(
        ServiceMoniker::new(CALCULATOR),
        ServiceRegistration::new(ServiceAudience::LocalMachine),
    )])?;
    container.proffer_factory(
        ServiceRpcDescriptor::new(ServiceMoniker::new(CALCULATOR)),
        |moniker: ServiceMoniker, _options, _broker, _cancel| async move {
            info!("Activating a calculator for {}", moniker);
            Ok(Some(calculator_service()))
        },
    )?;
    Ok(container)
}

/// Typed client over a calculator proxy
pub struct CalculatorClient {
    proxy: Arc<ServiceProxy>,
}

impl FromProxy for CalculatorClient {
    fn from_proxy(proxy: Arc<ServiceProxy>) -> Self {
        Self { proxy }
    }
}

impl CalculatorClient {
    pub fn is_local(&self) -> bool {
        self.proxy.is_local()
    }

    pub async fn add(&self, a: i64, b: i64) -> hubrpc::Result<i64> {
        self.proxy.call("Add", vec![json!(a), json!(b)]).await
    }

    pub async fn subtract(&self, a: i64, b: i64) -> hubrpc::Result<i64> {
        self.proxy.call("Subtract", vec![json!(a), json!(b)]).await
    }

    pub async fn multiply(&self, a: i64, b: i64) -> hubrpc::Result<i64> {
        self.proxy.call("Multiply", vec![json!(a), json!(b)]).await
    }

    pub async fn divide(&self, a: i64, b: i64) -> hubrpc::Result<Division> {
        self.proxy.call("Divide", vec![json!(a), json!(b)]).await
    }

    pub fn dispose(&self) {
        self.proxy.dispose();
    }
}
