use serde::{Deserialize, Serialize};

use super::error::{Result, RpcError};

/// Header prefixing every call frame in either direction.
///
/// The same shape travels both ways: a request carries an empty `error`,
/// a response echoes the request's `seq` and fills `error` when the server
/// failed to produce a reply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// `"Service.Method"` identifier, split on the last `.`.
    pub service_method: String,
    /// Sequence number, unique per client connection, monotonic from 1.
    pub seq: u64,
    /// Empty on requests and successful responses.
    pub error: String,
}

impl Header {
    pub fn request(service_method: impl Into<String>, seq: u64) -> Self {
        Header {
            service_method: service_method.into(),
            seq,
            error: String::new(),
        }
    }
}

/// Splits a `"Service.Method"` identifier on its last `.`.
pub fn split_service_method(service_method: &str) -> Result<(&str, &str)> {
    match service_method.rsplit_once('.') {
        Some((service, method)) if !service.is_empty() && !method.is_empty() => {
            Ok((service, method))
        }
        _ => Err(RpcError::Remote(format!(
            "rpc server: service/method request ill-formed: {service_method}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_on_last_dot() {
        let (service, method) = split_service_method("FooSvc.Sum").unwrap();
        assert_eq!(service, "FooSvc");
        assert_eq!(method, "Sum");
    }

    #[test]
    fn split_keeps_dotted_service_names() {
        let (service, method) = split_service_method("ns.FooSvc.Sum").unwrap();
        assert_eq!(service, "ns.FooSvc");
        assert_eq!(method, "Sum");
    }

    #[test]
    fn split_rejects_ill_formed_names() {
        for bad in ["Sum", "FooSvc.", ".Sum", ""] {
            let err = split_service_method(bad).unwrap_err();
            assert!(err.to_string().contains("ill-formed"), "{bad}: {err}");
        }
    }
}
