use anyhow::{Context, Result};
use fleet_model::HostId;
use std::collections::HashSet;
use std::path::Path;

/// Normalizes free-form host input: tokens are separated by commas,
/// semicolons or any whitespace, empty tokens are dropped and duplicates
/// keep their first position. Never fails; an empty result is the caller's
/// problem.
pub fn parse_hosts(raw: &str) -> Vec<HostId> {
    dedupe_hosts(
        raw.split(|c: char| c == ',' || c == ';' || c.is_whitespace())
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(str::to_string),
    )
}

/// Reads a host file; `#` starts a comment that runs to end of line.
pub fn parse_host_file(path: &Path) -> Result<Vec<HostId>> {
    let body = std::fs::read_to_string(path)
        .with_context(|| format!("reading host file {}", path.display()))?;
    let stripped: Vec<&str> = body
        .lines()
        .map(|line| line.split_once('#').map_or(line, |(before, _)| before))
        .collect();
    Ok(parse_hosts(&stripped.join("\n")))
}

/// Order-preserving deduplication.
pub fn dedupe_hosts<I>(hosts: I) -> Vec<HostId>
where
    I: IntoIterator<Item = HostId>,
{
    let mut seen = HashSet::new();
    hosts
        .into_iter()
        .filter(|host| seen.insert(host.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn splits_on_every_separator() {
        let hosts = parse_hosts("host1, host2;host3\nhost4\n\nhost5\thost6\r\nhost7");
        assert_eq!(
            hosts,
            vec!["host1", "host2", "host3", "host4", "host5", "host6", "host7"]
        );
    }

    #[test]
    fn deduplicates_in_first_seen_order() {
        assert_eq!(parse_hosts("a,a,b"), vec!["a", "b"]);
        assert_eq!(parse_hosts("b a b c a"), vec!["b", "a", "c"]);
    }

    #[test]
    fn malformed_input_yields_no_hosts() {
        assert!(parse_hosts("").is_empty());
        assert!(parse_hosts(" ,;\n\t, ").is_empty());
    }

    #[test]
    fn parsing_is_idempotent() {
        for raw in ["a,a,b", "x y\nz;x", " web-1 ,db-1\n\nweb-1 ", "", "solo"] {
            let once = parse_hosts(raw);
            let twice = parse_hosts(&once.join("\n"));
            assert_eq!(once, twice, "input {raw:?}");
        }
    }

    #[test]
    fn host_file_ignores_comments() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# web tier").unwrap();
        writeln!(file, "web-1 web-2  # primary").unwrap();
        writeln!(file, "db-1,web-1").unwrap();
        let hosts = parse_host_file(file.path()).unwrap();
        assert_eq!(hosts, vec!["web-1", "web-2", "db-1"]);
    }

    #[test]
    fn missing_host_file_is_an_error() {
        assert!(parse_host_file(Path::new("/nonexistent/hosts.txt")).is_err());
    }
}
