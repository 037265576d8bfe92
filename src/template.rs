//! URL templates: route matching and backend URL composition
//!
//! Template grammar: a path split on `/`, where each piece is one of
//! - `text`: a literal, matched ASCII case-insensitively
//! - `{name}`: a parameter binding exactly one non-empty segment
//! - `{*name}`: a wildcard binding one or more remaining segments
//! - `{*name?}`: a wildcard that may also bind nothing
//!
//! A wildcard must be the last segment.

use std::collections::BTreeMap;

/// Errors raised while parsing or expanding a template
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    #[error("wildcard '{0}' must be the last segment")]
    WildcardNotLast(String),
    #[error("malformed segment '{0}'")]
    MalformedSegment(String),
    #[error("parameter '{0}' is declared twice")]
    DuplicateParameter(String),
    #[error("no value bound for parameter '{0}'")]
    MissingValue(String),
    #[error("backend url '{0}' must start with http:// or https://")]
    InvalidScheme(String),
    #[error("backend url '{0}' has no host")]
    MissingHost(String),
}

/// One piece of a URL template
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    Parameter(String),
    Wildcard { name: String, allow_empty: bool },
}

impl Segment {
    fn parse(piece: &str) -> Result<Self, TemplateError> {
        let inner = match piece.strip_prefix('{').and_then(|p| p.strip_suffix('}')) {
            Some(inner) => inner,
            None => {
                if piece.contains('{') || piece.contains('}') {
                    return Err(TemplateError::MalformedSegment(piece.to_string()));
                }
                return Ok(Segment::Literal(piece.to_string()));
            }
        };

        let (wildcard, name) = match inner.strip_prefix('*') {
            Some(rest) => (true, rest),
            None => (false, inner),
        };
        let (allow_empty, name) = match name.strip_suffix('?') {
            Some(rest) if wildcard => (true, rest),
            _ => (false, name),
        };

        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.');
        if !valid {
            return Err(TemplateError::MalformedSegment(piece.to_string()));
        }

        Ok(if wildcard {
            Segment::Wildcard {
                name: name.to_string(),
                allow_empty,
            }
        } else {
            Segment::Parameter(name.to_string())
        })
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            Segment::Literal(_) => None,
            Segment::Parameter(name) | Segment::Wildcard { name, .. } => Some(name),
        }
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self, Segment::Wildcard { .. })
    }
}

/// Split a request path into segments, ignoring one leading and one trailing slash
fn split_path(path: &str) -> Vec<&str> {
    let path = path.strip_prefix('/').unwrap_or(path);
    let path = path.strip_suffix('/').unwrap_or(path);
    if path.is_empty() {
        Vec::new()
    } else {
        path.split('/').collect()
    }
}

/// A parsed path template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlTemplate {
    raw: String,
    segments: Vec<Segment>,
    trailing_slash: bool,
}

impl UrlTemplate {
    pub fn parse(raw: &str) -> Result<Self, TemplateError> {
        let trimmed = raw.trim();
        let trailing_slash = trimmed.len() > 1 && trimmed.ends_with('/');

        let segments = split_path(trimmed)
            .into_iter()
            .map(Segment::parse)
            .collect::<Result<Vec<_>, _>>()?;

        let mut seen: Vec<&str> = Vec::new();
        for (i, segment) in segments.iter().enumerate() {
            if let Segment::Wildcard { name, .. } = segment {
                if i + 1 != segments.len() {
                    return Err(TemplateError::WildcardNotLast(name.clone()));
                }
            }
            if let Some(name) = segment.name() {
                if seen.iter().any(|s| s.eq_ignore_ascii_case(name)) {
                    return Err(TemplateError::DuplicateParameter(name.to_string()));
                }
                seen.push(name);
            }
        }

        Ok(Self {
            raw: trimmed.to_string(),
            segments,
            trailing_slash,
        })
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn last_segment(&self) -> Option<&Segment> {
        self.segments.last()
    }

    pub fn parameter_names(&self) -> Vec<&str> {
        self.segments.iter().filter_map(Segment::name).collect()
    }

    /// Match a request path, returning the bound parameter values
    pub fn matches(&self, path: &str) -> Option<BTreeMap<String, String>> {
        let parts = split_path(path);
        let mut params = BTreeMap::new();

        for (i, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::Literal(text) => {
                    let part = parts.get(i)?;
                    if !part.eq_ignore_ascii_case(text) {
                        return None;
                    }
                }
                Segment::Parameter(name) => {
                    let part = parts.get(i)?;
                    if part.is_empty() {
                        return None;
                    }
                    params.insert(name.clone(), (*part).to_string());
                }
                Segment::Wildcard { name, allow_empty } => {
                    let tail = parts.get(i..).unwrap_or(&[]);
                    if tail.is_empty() && !allow_empty {
                        return None;
                    }
                    params.insert(name.clone(), tail.join("/"));
                    return Some(params);
                }
            }
        }

        if parts.len() == self.segments.len() {
            Some(params)
        } else {
            None
        }
    }

    /// Substitute bound values into the template.
    ///
    /// When `request_trailing_slash` is set the trailing `/` is kept only if the
    /// template ends in a wildcard; literal and parameter endings drop it.
    pub fn compose(
        &self,
        params: &BTreeMap<String, String>,
        request_trailing_slash: bool,
    ) -> Result<String, TemplateError> {
        let mut pieces: Vec<&str> = Vec::with_capacity(self.segments.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => pieces.push(text),
                Segment::Parameter(name) | Segment::Wildcard { name, .. } => {
                    let value = param_value(params, name)
                        .ok_or_else(|| TemplateError::MissingValue(name.clone()))?;
                    if !value.is_empty() {
                        pieces.push(value);
                    }
                }
            }
        }

        let mut path = format!("/{}", pieces.join("/"));
        let keep_slash = self.trailing_slash
            || (request_trailing_slash
                && self.last_segment().is_some_and(Segment::is_wildcard));
        if keep_slash && !path.ends_with('/') {
            path.push('/');
        }
        Ok(path)
    }
}

/// Backend URL template: scheme and authority plus a path template and optional query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendTemplate {
    raw: String,
    scheme: String,
    authority: String,
    path: UrlTemplate,
    query: Option<String>,
}

impl BackendTemplate {
    pub fn parse(raw: &str) -> Result<Self, TemplateError> {
        let raw = raw.trim();
        let (scheme, rest) = if let Some(rest) = raw.strip_prefix("http://") {
            ("http", rest)
        } else if let Some(rest) = raw.strip_prefix("https://") {
            ("https", rest)
        } else {
            return Err(TemplateError::InvalidScheme(raw.to_string()));
        };

        let authority_end = rest.find(['/', '?']).unwrap_or(rest.len());
        let authority = &rest[..authority_end];
        if authority.is_empty() {
            return Err(TemplateError::MissingHost(raw.to_string()));
        }

        let remainder = &rest[authority_end..];
        let (path, query) = match remainder.split_once('?') {
            Some((path, query)) => (path, Some(query.to_string())),
            None => (remainder, None),
        };

        Ok(Self {
            raw: raw.to_string(),
            scheme: scheme.to_string(),
            authority: authority.to_string(),
            path: UrlTemplate::parse(if path.is_empty() { "/" } else { path })?,
            query: query.filter(|q| !q.is_empty()),
        })
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    pub fn path(&self) -> &UrlTemplate {
        &self.path
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// Host without port
    pub fn host(&self) -> &str {
        self.authority
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(&self.authority)
    }

    pub fn has_explicit_port(&self) -> bool {
        self.authority.contains(':')
    }

    /// True if the backend resolves to this host's own function routes
    pub fn is_local(&self, host_name: &str) -> bool {
        (self.host().eq_ignore_ascii_case("localhost") && !self.has_explicit_port())
            || self.authority.eq_ignore_ascii_case(host_name)
    }

    /// Compose the outbound URL.
    ///
    /// `expand` is applied to the template's own query before the inbound
    /// query is appended unchanged.
    pub fn compose(
        &self,
        params: &BTreeMap<String, String>,
        request_trailing_slash: bool,
        inbound_query: &str,
        expand: impl Fn(&str) -> String,
    ) -> Result<String, TemplateError> {
        let path = self.path.compose(params, request_trailing_slash)?;

        let mut query_parts: Vec<String> = Vec::new();
        if let Some(query) = &self.query {
            query_parts.push(expand(query));
        }
        if !inbound_query.is_empty() {
            query_parts.push(inbound_query.to_string());
        }

        let mut url = format!("{}://{}{}", self.scheme, self.authority, path);
        if !query_parts.is_empty() {
            url.push('?');
            url.push_str(&query_parts.join("&"));
        }
        Ok(url)
    }
}

/// Replace `{name}` placeholders using `resolve`; names it cannot resolve stay verbatim
pub fn expand_with(text: &str, resolve: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                match resolve(name) {
                    Some(value) => out.push_str(&value),
                    None => {
                        out.push('{');
                        out.push_str(name);
                        out.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Look up a bound parameter. Names compare case-insensitively, like the
/// duplicate check in [`UrlTemplate::parse`].
pub fn param_value<'a>(params: &'a BTreeMap<String, String>, name: &str) -> Option<&'a String> {
    params.get(name).or_else(|| {
        params
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value)
    })
}

/// Replace `{name}` occurrences with bound parameter values
pub fn expand_params(text: &str, params: &BTreeMap<String, String>) -> String {
    expand_with(text, |name| param_value(params, name).cloned())
}
