use super::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LocationParts {
    pub(crate) scheme: String,
    pub(crate) has_authority: bool,
    pub(crate) username: String,
    pub(crate) password: String,
    pub(crate) hostname: String,
    pub(crate) port: String,
    pub(crate) pathname: String,
    pub(crate) opaque_path: String,
    pub(crate) search: String,
    pub(crate) hash: String,
}

impl LocationParts {
    pub(crate) fn protocol(&self) -> String {
        format!("{}:", self.scheme)
    }

    pub(crate) fn host(&self) -> String {
        if self.port.is_empty() {
            self.hostname.clone()
        } else {
            format!("{}:{}", self.hostname, self.port)
        }
    }

    pub(crate) fn origin(&self) -> String {
        if self.has_authority && !self.hostname.is_empty() {
            format!("{}//{}", self.protocol(), self.host())
        } else {
            "null".to_string()
        }
    }

    /// `protocol//host`, the part of a guest url the sandbox treats as its host path.
    pub(crate) fn host_path(&self) -> String {
        format!("{}//{}", self.protocol(), self.host())
    }

    /// `pathname + search + hash`, always starting with `/`.
    pub(crate) fn route_path(&self) -> String {
        let path = if self.has_authority {
            self.pathname.clone()
        } else {
            self.opaque_path.clone()
        };
        let route = format!("{}{}{}", path, self.search, self.hash);
        if route.starts_with('/') {
            route
        } else {
            format!("/{route}")
        }
    }

    pub(crate) fn href(&self) -> String {
        if self.has_authority {
            let path = if self.pathname.is_empty() {
                "/".to_string()
            } else {
                self.pathname.clone()
            };
            let credentials = if self.username.is_empty() && self.password.is_empty() {
                String::new()
            } else if self.password.is_empty() {
                format!("{}@", self.username)
            } else {
                format!("{}:{}@", self.username, self.password)
            };
            format!(
                "{}//{}{}{}{}{}",
                self.protocol(),
                credentials,
                self.host(),
                path,
                self.search,
                self.hash
            )
        } else {
            format!(
                "{}{}{}{}",
                self.protocol(),
                self.opaque_path,
                self.search,
                self.hash
            )
        }
    }

    pub(crate) fn parse(input: &str) -> Option<Self> {
        let trimmed = input.trim();
        let scheme_end = trimmed.find(':')?;
        let scheme = trimmed[..scheme_end].to_ascii_lowercase();
        if !is_valid_url_scheme(&scheme) {
            return None;
        }
        let rest = &trimmed[scheme_end + 1..];
        if let Some(without_slashes) = rest.strip_prefix("//") {
            let authority_end = without_slashes
                .find(|ch| ['/', '?', '#'].contains(&ch))
                .unwrap_or(without_slashes.len());
            let authority = &without_slashes[..authority_end];
            let tail = &without_slashes[authority_end..];
            let Authority {
                username,
                password,
                hostname,
                port,
            } = Authority::parse(authority);
            let (pathname, search, hash) = split_path_search_hash(tail);
            let pathname = if pathname.is_empty() {
                "/".to_string()
            } else {
                normalize_pathname(&pathname)
            };
            let port = if is_default_port(&scheme, &port) {
                String::new()
            } else {
                port
            };
            Some(Self {
                scheme,
                has_authority: true,
                username,
                password,
                hostname: hostname.to_ascii_lowercase(),
                port,
                pathname,
                opaque_path: String::new(),
                search,
                hash,
            })
        } else {
            let (opaque_path, search, hash) = split_path_search_hash(rest);
            Some(Self {
                scheme,
                has_authority: false,
                username: String::new(),
                password: String::new(),
                hostname: String::new(),
                port: String::new(),
                pathname: String::new(),
                opaque_path,
                search,
                hash,
            })
        }
    }

    /// Resolves `input` the way an anchor element's `href` setter would.
    pub(crate) fn resolve(&self, input: &str) -> String {
        let input = input.trim();
        if input.is_empty() {
            return self.href();
        }
        if let Some(absolute) = Self::parse(input) {
            return absolute.href();
        }

        if input.starts_with("//") {
            return Self::parse(&format!("{}{}", self.protocol(), input))
                .map(|parts| parts.href())
                .unwrap_or_else(|| input.to_string());
        }

        let mut next = self.clone();
        if input.starts_with('#') {
            next.hash = input.to_string();
            return next.href();
        }

        if input.starts_with('?') {
            let (search, hash) = match input.find('#') {
                Some(pos) => (&input[..pos], &input[pos..]),
                None => (input, ""),
            };
            next.search = search.to_string();
            next.hash = hash.to_string();
            return next.href();
        }

        let (relative, search, hash) = split_path_search_hash(input);
        if next.has_authority {
            next.pathname = if relative.starts_with('/') {
                normalize_pathname(&relative)
            } else {
                let base_dir = match next.pathname.rsplit_once('/') {
                    Some((prefix, _)) if !prefix.is_empty() => format!("{prefix}/"),
                    _ => "/".to_string(),
                };
                normalize_pathname(&format!("{base_dir}{relative}"))
            };
        } else {
            next.opaque_path = relative;
        }
        next.search = search;
        next.hash = hash;
        next.href()
    }
}

/// Parses `url` as an absolute url, or resolves it against `base`.
pub(crate) fn resolve_url(input: &str, base: &str) -> Option<String> {
    if let Some(parts) = LocationParts::parse(input) {
        return Some(parts.href());
    }
    let base = LocationParts::parse(base)?;
    Some(base.resolve(input))
}

/// Absolute form of `url` against `base`, leaving the input untouched when it cannot be
/// resolved. With `keep_hash` a bare fragment is returned as-is.
pub(crate) fn absolute_path(url: &str, base: &str, keep_hash: bool) -> String {
    if url.is_empty() {
        return String::new();
    }
    if keep_hash && url.starts_with('#') {
        return url.to_string();
    }
    resolve_url(url, base).unwrap_or_else(|| url.to_string())
}

/// `origin + directory-of-path + "/"`, or an empty string for an unparsable entry.
pub(crate) fn default_public_path(entry: &str, base: &str) -> String {
    let Some(href) = resolve_url(entry, base) else {
        return String::new();
    };
    let Some(parts) = LocationParts::parse(&href) else {
        return String::new();
    };
    let mut segments: Vec<&str> = parts.pathname.split('/').collect();
    segments.pop();
    format!("{}{}/", parts.origin(), segments.join("/"))
}

fn is_valid_url_scheme(scheme: &str) -> bool {
    scheme.chars().next().is_some_and(|first| first.is_ascii_alphabetic())
        && scheme
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '+' | '-' | '.'))
}

fn is_default_port(scheme: &str, port: &str) -> bool {
    matches!((scheme, port), ("http", "80") | ("https", "443") | ("ws", "80") | ("wss", "443"))
}

/// Pieces of an authority: `user:password@host:port`.
#[derive(Debug, Default)]
struct Authority {
    username: String,
    password: String,
    hostname: String,
    port: String,
}

impl Authority {
    fn parse(authority: &str) -> Self {
        let (userinfo, hostport) = authority.rsplit_once('@').unwrap_or(("", authority));
        let (username, password) = userinfo.split_once(':').unwrap_or((userinfo, ""));
        let (hostname, port) = match hostport.strip_prefix('[').and_then(|rest| rest.find(']')) {
            // Bracketed IPv6 literal; the brackets stay part of the hostname.
            Some(close) => {
                let (hostname, suffix) = hostport.split_at(close + 2);
                (hostname, suffix.strip_prefix(':').unwrap_or(""))
            }
            None => match hostport.rsplit_once(':') {
                Some((hostname, port)) if !hostname.contains(':') => (hostname, port),
                _ => (hostport, ""),
            },
        };
        Self {
            username: username.to_string(),
            password: password.to_string(),
            hostname: hostname.to_string(),
            port: port.to_string(),
        }
    }
}

/// `path?search#hash` split into its three parts; search and hash keep their markers.
fn split_path_search_hash(tail: &str) -> (String, String, String) {
    let (rest, hash) = match tail.find('#') {
        Some(at) => tail.split_at(at),
        None => (tail, ""),
    };
    let (path, search) = match rest.find('?') {
        Some(at) => rest.split_at(at),
        None => (rest, ""),
    };
    (path.to_string(), search.to_string(), hash.to_string())
}

/// Collapses `.` and `..` segments and duplicate slashes. A trailing slash survives.
fn normalize_pathname(pathname: &str) -> String {
    let segments = pathname.split('/').fold(Vec::new(), |mut kept, segment| {
        match segment {
            "" | "." => {}
            ".." => {
                kept.pop();
            }
            other => kept.push(other),
        }
        kept
    });
    let lead = if pathname.starts_with('/') { "/" } else { "" };
    let mut out = format!("{lead}{}", segments.join("/"));
    if out.is_empty() || (pathname.len() > 1 && pathname.ends_with('/') && !out.ends_with('/')) {
        out.push('/');
    }
    out
}

/// `encodeURIComponent`.
pub fn encode_uri_component(src: &str) -> String {
    let mut out = String::with_capacity(src.len());
    for byte in src.bytes() {
        if byte.is_ascii_alphanumeric() || b"-_.!~*'()".contains(&byte) {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

/// `decodeURIComponent`; malformed escapes are an error.
pub fn decode_uri_component(src: &str) -> Result<String> {
    let malformed = || Error::Configuration(format!("malformed URI sequence: {src}"));
    let mut raw = Vec::with_capacity(src.len());
    let mut bytes = src.bytes();
    while let Some(byte) = bytes.next() {
        if byte != b'%' {
            raw.push(byte);
            continue;
        }
        let (Some(hi), Some(lo)) = (bytes.next(), bytes.next()) else {
            return Err(malformed());
        };
        let digit = |byte: u8| char::from(byte).to_digit(16).ok_or_else(malformed);
        let value = (digit(hi)? << 4) | digit(lo)?;
        raw.push(value as u8);
    }
    String::from_utf8(raw).map_err(|_| malformed())
}
