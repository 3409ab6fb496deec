use std::borrow::Cow;
use std::env;
use std::fmt;
use std::io::Write;
use std::path::MAIN_SEPARATOR;

use ansi_term::Color;
use env_logger::Builder;
use log::{Level, LevelFilter};

struct ColorLevel(Level);

impl fmt::Display for ColorLevel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.0 {
            Level::Trace => Color::Purple.paint("TRACE"),
            Level::Debug => Color::Blue.paint("DEBUG"),
            Level::Info => Color::Green.paint("INFO "),
            Level::Warn => Color::Yellow.paint("WARN "),
            Level::Error => Color::Red.paint("ERROR"),
        }
        .fmt(f)
    }
}

pub fn init_logger() {
    let mut builder = Builder::new();
    builder
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}]  {}",
                buf.timestamp_millis(),
                ColorLevel(record.level()),
                record.args()
            )
        })
        .filter(None, LevelFilter::Info);

    if let Ok(rust_log) = env::var("RUST_LOG") {
        builder.parse_filters(&rust_log);
    }

    if let Ok(umbra_log) = env::var("UMBRA_LOG") {
        builder.parse_filters(&umbra_log);
    }

    builder.init();
}

/// Expand path like ~/xxx
pub fn expand_tilde_path(path: &str) -> Cow<str> {
    if !path.starts_with('~') {
        return path.into();
    }

    let path_after_tilde = &path[1..];

    // on support windows `\`
    if path_after_tilde.is_empty()
        || path_after_tilde.starts_with('/')
        || path_after_tilde.starts_with(MAIN_SEPARATOR)
    {
        #[allow(deprecated)]
        if let Some(hd) = env::home_dir() {
            let result = format!("{}{}", hd.display(), path_after_tilde);
            result.into()
        } else {
            // home dir is not available
            path.into()
        }
    } else {
        // we cannot handle `~otheruser/` paths yet
        path.into()
    }
}

#[cfg(test)]
mod test {
    use std::env;

    #[test]
    fn test_expand_tilde_path() {
        let old_home = env::var("HOME").ok();
        env::set_var("HOME", "/home/morty");

        assert_eq!("/home/morty", super::expand_tilde_path("~"));
        assert_eq!("/home/morty/rick", super::expand_tilde_path("~/rick"));
        assert_eq!("~rick", super::expand_tilde_path("~rick"));
        assert_eq!("/home", super::expand_tilde_path("/home"));

        if let Some(old) = old_home {
            env::set_var("HOME", old);
        }
    }
}
