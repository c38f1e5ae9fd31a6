use crate::host::{PathInfo, ProcessVar};

/// Value stored in a [`RequestEnv`].
#[derive(Debug, Clone, PartialEq)]
pub enum EnvValue {
    Text(String),
    Number(f64),
}

/// Ordered name/value table handed to the request handler. Names are unique;
/// setting an existing name replaces its value in place.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestEnv {
    entries: Vec<(String, EnvValue)>,
}

impl RequestEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: EnvValue) {
        let name = name.into();
        match self.entries.iter_mut().find(|(existing, _)| *existing == name) {
            Some((_, slot)) => *slot = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&EnvValue> {
        self.entries
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, value)| value)
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        match self.get(name)? {
            EnvValue::Text(text) => Some(text.as_str()),
            EnvValue::Number(_) => None,
        }
    }

    pub fn number(&self, name: &str) -> Option<f64> {
        match self.get(name)? {
            EnvValue::Number(number) => Some(*number),
            EnvValue::Text(_) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &EnvValue)> {
        self.entries.iter().map(|(name, value)| (name.as_str(), value))
    }
}

/// `HTTP_VERSION` as scripts see it. The host numbers versions 0, 1, 2 for
/// HTTP/0.9, 1.0, 1.1.
pub fn http_version_value(protocol_version: u8) -> f64 {
    0.9 + (f64::from(protocol_version) / 10.0)
}

/// Splits `url` at the first `?`, returning the path length and the query including `?`.
pub fn split_url(url: &str) -> (usize, Option<&str>) {
    match url.find('?') {
        Some(index) => (index, Some(&url[index..])),
        None => (url.len(), None),
    }
}

// Intent: assemble the CGI-like table for one request.
// Result: PATH_INFO, host variables, and HTTP_VERSION land in one fresh table, with the
// query recorded on path_info before the host feed is consulted.
pub fn build_request_env<F>(
    prefix: &str,
    url: &str,
    protocol_version: u8,
    path_info: &mut PathInfo,
    process_vars: F,
) -> RequestEnv
where
    F: FnOnce(&PathInfo) -> Vec<ProcessVar>,
{
    let mut env = RequestEnv::new();

    let (path_len, query) = split_url(url);
    if let Some(query) = query {
        path_info.query = Some(query.to_string());
    }

    if path_len > prefix.len() {
        if let Some(suffix) = url.get(prefix.len()..path_len) {
            env.set("PATH_INFO", EnvValue::Text(suffix.to_string()));
        }
    }

    for var in process_vars(path_info)
        .into_iter()
        .take_while(|var| !var.is_sentinel())
    {
        if let Some(value) = var.value {
            env.set(var.name, EnvValue::Text(value));
        }
    }

    env.set(
        "HTTP_VERSION",
        EnvValue::Number(http_version_value(protocol_version)),
    );
    env
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, Option<&str>)]) -> Vec<ProcessVar> {
        let mut vars: Vec<ProcessVar> = pairs
            .iter()
            .map(|(name, value)| ProcessVar::new(*name, value.map(str::to_string)))
            .collect();
        vars.push(ProcessVar::sentinel());
        vars
    }

    #[test]
    fn builds_scenario_environment() {
        let mut pi = PathInfo::new("/lua/", "/www/handler.lua");
        let env = build_request_env("/lua/", "/lua/app?x=1", 2, &mut pi, |_| {
            vars(&[("REQUEST_METHOD", Some("GET")), ("HTTP_HOST", Some("example"))])
        });

        assert_eq!(env.text("PATH_INFO"), Some("app"));
        assert_eq!(pi.query.as_deref(), Some("?x=1"));
        assert_eq!(env.text("REQUEST_METHOD"), Some("GET"));
        assert_eq!(env.text("HTTP_HOST"), Some("example"));
        assert_eq!(env.number("HTTP_VERSION"), Some(0.9 + 2.0 / 10.0));
    }

    #[test]
    fn http_version_follows_formula() {
        for version in [0_u8, 1, 2, 10, 11] {
            assert_eq!(
                http_version_value(version),
                0.9 + (f64::from(version) / 10.0)
            );
        }
        assert!((http_version_value(1) - 1.0).abs() < 1e-12);
        assert!((http_version_value(2) - 1.1).abs() < 1e-12);
        assert!((http_version_value(10) - 1.9).abs() < 1e-12);
    }

    #[test]
    fn path_info_absent_when_url_equals_prefix() {
        let mut pi = PathInfo::default();
        let env = build_request_env("/lua", "/lua?debug", 1, &mut pi, |_| vars(&[]));
        assert!(env.get("PATH_INFO").is_none());
        assert_eq!(pi.query.as_deref(), Some("?debug"));
    }

    #[test]
    fn path_info_keeps_everything_after_prefix() {
        let mut pi = PathInfo::default();
        let env = build_request_env("/lua", "/lua/a/b", 1, &mut pi, |_| vars(&[]));
        assert_eq!(env.text("PATH_INFO"), Some("/a/b"));
        assert!(pi.query.is_none());
    }

    #[test]
    fn feed_sees_query_and_stops_at_sentinel() {
        let mut pi = PathInfo::default();
        let env = build_request_env("/lua", "/lua?q", 1, &mut pi, |pi| {
            assert_eq!(pi.query.as_deref(), Some("?q"));
            let mut feed = vars(&[("A", Some("1")), ("SKIPPED", None)]);
            feed.push(ProcessVar::new("AFTER_SENTINEL", Some("x".into())));
            feed
        });
        assert_eq!(env.text("A"), Some("1"));
        assert!(env.get("SKIPPED").is_none());
        assert!(env.get("AFTER_SENTINEL").is_none());
    }

    #[test]
    fn names_stay_unique() {
        let mut pi = PathInfo::default();
        let env = build_request_env("/lua", "/lua", 1, &mut pi, |_| {
            vars(&[("A", Some("1")), ("A", Some("2")), ("HTTP_VERSION", Some("bogus"))])
        });
        assert_eq!(env.text("A"), Some("2"));
        assert_eq!(env.number("HTTP_VERSION"), Some(http_version_value(1)));
        assert_eq!(env.len(), 2);
    }
}
