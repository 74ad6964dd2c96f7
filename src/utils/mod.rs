use std::env;
use std::path::{Path, PathBuf};

pub mod io;
#[macro_use]
pub mod log;
pub mod process;

macro_rules! fxhashmap {
    ($($key:expr => $value:expr,)+) => { fxhashmap!($($key => $value),+) };
    ($($key:expr => $value:expr),*) => {
        {
            let mut _map = ::rustc_hash::FxHashMap::default();
            $(
                let _ = _map.insert($key, $value);
            )*
            _map.shrink_to_fit();
            _map
        }
    };
}

/// `path` joined to the current directory if it is relative. Nothing is resolved on disk.
pub fn absolute<P: AsRef<Path>>(path: P) -> std::io::Result<PathBuf> {
    let path = path.as_ref();
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(env::current_dir()?.join(path))
    }
}

/// Resolve a tool name the way a shell would: paths containing a separator are taken as is,
/// bare names are searched in `$PATH`.
pub fn which<P: AsRef<Path>>(tool: P) -> Option<PathBuf> {
    let tool = tool.as_ref();
    if tool.components().count() > 1 {
        return if tool.is_file() {
            Some(tool.to_path_buf())
        } else {
            None
        };
    }
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths)
        .map(|dir| dir.join(tool))
        .find(|candidate| candidate.is_file())
}

#[cfg(test)]
mod tests {
    use super::{absolute, which};
    use std::{env, path::Path};

    #[test]
    fn which_finds_shell() {
        assert!(which("sh").is_some());
        assert!(which("/bin/sh").is_some());
    }

    #[test]
    fn which_misses_unknown_tool() {
        assert!(which("fuzzvisor-no-such-tool").is_none());
        assert!(which("/nonexistent/dir/tool").is_none());
    }

    #[test]
    fn relative_paths_joined_to_cwd() {
        let cwd = env::current_dir().unwrap();
        assert_eq!(absolute("work/a").unwrap(), cwd.join("work/a"));
        assert_eq!(absolute("/bin/sh").unwrap(), Path::new("/bin/sh"));
    }
}
