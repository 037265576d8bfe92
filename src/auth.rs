//! Function key validation

use crate::binding::HttpRequestData;
use crate::config::AuthLevel;
use crate::function::FunctionDescriptor;

/// Header carrying a function key
pub const FUNCTION_KEY_HEADER: &str = "x-functions-key";

/// Query parameter carrying a function key
pub const FUNCTION_KEY_QUERY: &str = "code";

/// Decides whether a request may call a function
pub trait KeyValidator: Send + Sync {
    fn validate(&self, descriptor: &FunctionDescriptor, request: &HttpRequestData) -> bool;
}

/// Accepts the keys listed in each function's configuration
#[derive(Debug, Default, Clone, Copy)]
pub struct ConfiguredKeys;

/// Constant-time comparison
fn keys_equal(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

impl KeyValidator for ConfiguredKeys {
    fn validate(&self, descriptor: &FunctionDescriptor, request: &HttpRequestData) -> bool {
        if descriptor.auth_level == AuthLevel::Anonymous {
            return true;
        }

        let presented = request
            .header(FUNCTION_KEY_HEADER)
            .map(str::to_string)
            .or_else(|| request.query_param(FUNCTION_KEY_QUERY));

        match presented {
            Some(key) => descriptor.keys.iter().any(|k| keys_equal(k, &key)),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FunctionConfig;
    use hyper::body::Bytes;
    use hyper::header::{HeaderMap, HeaderValue};
    use hyper::Method;
    use std::collections::BTreeMap;
    use std::path::Path;

    fn descriptor(keys: &[&str]) -> FunctionDescriptor {
        let mut config = FunctionConfig::new("Secure", "s.json", "declarative");
        if !keys.is_empty() {
            config = config.with_keys(keys);
        }
        FunctionDescriptor::from_config(&config, "api", Path::new(".")).unwrap()
    }

    fn request(query: &str, header: Option<&'static str>) -> HttpRequestData {
        let mut headers = HeaderMap::new();
        if let Some(value) = header {
            headers.insert(FUNCTION_KEY_HEADER, HeaderValue::from_static(value));
        }
        HttpRequestData {
            method: Method::GET,
            url: format!("http://localhost/api/Secure?{}", query),
            path: "/api/Secure".to_string(),
            query: query.to_string(),
            headers,
            body: Bytes::new(),
            params: BTreeMap::new(),
            response: None,
        }
    }

    #[test]
    fn test_anonymous_always_allowed() {
        assert!(ConfiguredKeys.validate(&descriptor(&[]), &request("", None)));
    }

    #[test]
    fn test_key_in_query_or_header() {
        let secure = descriptor(&["abc", "def"]);
        assert!(ConfiguredKeys.validate(&secure, &request("code=abc", None)));
        assert!(ConfiguredKeys.validate(&secure, &request("", Some("def"))));
        assert!(!ConfiguredKeys.validate(&secure, &request("code=abd", None)));
        assert!(!ConfiguredKeys.validate(&secure, &request("", None)));
    }

    #[test]
    fn test_keys_equal() {
        assert!(keys_equal("abc", "abc"));
        assert!(!keys_equal("abc", "abcd"));
        assert!(!keys_equal("abc", "abx"));
    }
}
