use std::collections::HashMap;

use crate::{
    config::{Config, UpstreamProtocol},
    errors::{AppError, AppResult},
};

/// Connection details for one upstream
#[derive(Clone, PartialEq, Eq)]
pub struct UpstreamDescriptor {
    pub name: String,
    pub base_url: String,
    pub model: String,
    pub credential: Option<String>,
    pub protocol: UpstreamProtocol,
}

impl UpstreamDescriptor {
    /// Chat-completions endpoint under the base URL
    pub fn endpoint_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    /// The credential, or `MissingCredential` when it is absent or empty
    pub fn require_credential(&self) -> AppResult<&str> {
        self.credential
            .as_deref()
            .filter(|credential| !credential.is_empty())
            .ok_or_else(|| AppError::missing_credential(&self.name))
    }
}

impl std::fmt::Debug for UpstreamDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamDescriptor")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("credential", &self.credential.as_ref().map(|_| "<redacted>"))
            .field("protocol", &self.protocol)
            .finish()
    }
}

/// Read-only table of upstreams keyed by name
///
/// Built once at startup and shared behind an `Arc`; lookups need no locking.
#[derive(Debug, Clone, Default)]
pub struct UpstreamRegistry {
    upstreams: HashMap<String, UpstreamDescriptor>,
}

impl UpstreamRegistry {
    /// 从配置创建上游注册表
    ///
    /// ## 功能说明
    /// 遍历配置中的所有上游，解析凭证（内联值优先，其次是环境变量），生成不可变的描述符
    ///
    /// ## 说明
    /// 缺少凭证不会导致创建失败，只会在使用该上游时以 MissingCredential 报错
    pub fn from_config(config: &Config) -> Self {
        Self::from_descriptors(config.upstreams.iter().map(|(name, upstream)| {
            UpstreamDescriptor {
                name: name.clone(),
                base_url: upstream.base_url.clone(),
                model: upstream.model.clone(),
                credential: upstream.resolve_credential(),
                protocol: upstream.protocol,
            }
        }))
    }

    pub fn from_descriptors(descriptors: impl IntoIterator<Item = UpstreamDescriptor>) -> Self {
        let upstreams = descriptors
            .into_iter()
            .map(|descriptor| (descriptor.name.clone(), descriptor))
            .collect();

        Self { upstreams }
    }

    /// 根据名称查找上游
    ///
    /// 精确匹配，区分大小写，没有回退
    pub fn resolve(&self, name: &str) -> AppResult<&UpstreamDescriptor> {
        self.upstreams
            .get(name)
            .ok_or_else(|| AppError::UpstreamNotFound(name.to_string()))
    }

    /// Sorted upstream names
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.upstreams.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.upstreams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.upstreams.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(name: &str, credential: Option<&str>) -> UpstreamDescriptor {
        UpstreamDescriptor {
            name: name.to_string(),
            base_url: "https://upstream.example.com/v1/".to_string(),
            model: "m".to_string(),
            credential: credential.map(str::to_string),
            protocol: UpstreamProtocol::ChatCompletions,
        }
    }

    #[test]
    fn test_endpoint_url_trims_trailing_slash() {
        assert_eq!(
            descriptor("a", None).endpoint_url(),
            "https://upstream.example.com/v1/chat/completions"
        );
    }

    #[test]
    fn test_require_credential() {
        assert_eq!(descriptor("a", Some("sk-1")).require_credential().unwrap(), "sk-1");
        assert!(matches!(
            descriptor("a", None).require_credential(),
            Err(AppError::MissingCredential(name)) if name == "a"
        ));
        assert!(matches!(
            descriptor("a", Some("")).require_credential(),
            Err(AppError::MissingCredential(_))
        ));
    }

    #[test]
    fn test_debug_redacts_credential() {
        let rendered = format!("{:?}", descriptor("a", Some("sk-secret")));
        assert!(!rendered.contains("sk-secret"));
        assert!(rendered.contains("<redacted>"));
    }
}
