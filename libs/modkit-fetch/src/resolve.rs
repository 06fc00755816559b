//! Final request URL computation.

use crate::config::{Config, KeyValues};
use crate::error::{FetchError, InvalidUrlKind};
use url::Url;

/// Resolve the absolute request URL for `config`.
///
/// Path parameters are substituted first, then a host-less URL is joined
/// onto the base URL by path segment. When the URL as written contains `?`,
/// the base URL's query is appended before the explicit query entries.
/// Query values are appended, never replaced; empty values are skipped.
pub(crate) fn resolve_url(config: &Config) -> Result<Url, FetchError> {
    let substituted = substitute_params(&config.url, &config.params);

    let mut url = match Url::parse(&substituted) {
        Ok(url) => url,
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            join_base(&config.base_url, &substituted)?
        }
        Err(e) => {
            return Err(FetchError::invalid_url(
                substituted,
                InvalidUrlKind::ParseError,
                e,
            ));
        }
    };

    if !matches!(url.scheme(), "http" | "https") {
        return Err(FetchError::invalid_url(
            url.as_str(),
            InvalidUrlKind::UnsupportedScheme,
            format!("scheme '{}' is not http or https", url.scheme()),
        ));
    }
    if !url.has_host() {
        return Err(FetchError::invalid_url(
            url.as_str(),
            InvalidUrlKind::MissingHost,
            "url has no host",
        ));
    }

    let origin_query = if config.url.contains('?') && !config.base_url.is_empty() {
        let base = parse_base(&config.base_url)?;
        base.query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect::<Vec<_>>()
    } else {
        Vec::new()
    };

    let explicit: Vec<(&str, &str)> = config
        .query
        .iter()
        .filter(|(_, v)| !v.is_empty())
        .collect();
    if !origin_query.is_empty() || !explicit.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (k, v) in &origin_query {
            pairs.append_pair(k, v);
        }
        for (k, v) in explicit {
            pairs.append_pair(k, v);
        }
    }

    tracing::trace!(url = %url, "resolved request url");
    Ok(url)
}

/// Replace `:name` and `{name}` placeholders with percent-encoded values.
///
/// Placeholders without a matching parameter are left untouched.
pub(crate) fn substitute_params(template: &str, params: &KeyValues) -> String {
    if params.is_empty() {
        return template.to_owned();
    }

    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(pos) = rest.find([':', '{']) {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];

        if let Some(after) = tail.strip_prefix('{') {
            if let Some(end) = after.find('}')
                && let Some(value) = params.get(&after[..end])
            {
                out.push_str(&urlencoding::encode(value));
                rest = &after[end + 1..];
            } else {
                out.push('{');
                rest = after;
            }
            continue;
        }

        let after = &tail[1..];
        let len = after
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(after.len());
        if len > 0
            && let Some(value) = params.get(&after[..len])
        {
            out.push_str(&urlencoding::encode(value));
            rest = &after[len..];
        } else {
            out.push(':');
            rest = after;
        }
    }

    out.push_str(rest);
    out
}

fn parse_base(base_url: &str) -> Result<Url, FetchError> {
    Url::parse(base_url)
        .map_err(|e| FetchError::invalid_url(base_url, InvalidUrlKind::ParseError, e))
}

fn join_base(base_url: &str, relative: &str) -> Result<Url, FetchError> {
    if base_url.is_empty() {
        return Err(FetchError::invalid_url(
            relative,
            InvalidUrlKind::MissingHost,
            "relative url without base url",
        ));
    }
    let mut base = parse_base(base_url)?;

    let (rest, fragment) = match relative.split_once('#') {
        Some((rest, fragment)) => (rest, Some(fragment)),
        None => (relative, None),
    };
    let (path, query) = match rest.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (rest, None),
    };

    base.set_path(&join_paths(base.path(), path));
    base.set_query(query.filter(|q| !q.is_empty()));
    base.set_fragment(fragment);
    Ok(base)
}

/// Segment-wise join with `.`/`..` resolution; keeps a trailing slash of `rel`.
fn join_paths(base: &str, rel: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in base.split('/').chain(rel.split('/')) {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }

    let mut joined = format!("/{}", segments.join("/"));
    if rel.ends_with('/') && !joined.ends_with('/') {
        joined.push('/');
    }
    joined
}
