use env_logger::Builder;
use log::LevelFilter;
use std::io::Write;

const LIB_TARGET: &str = "tile_watch";

/// Logger named after the running executable, falling back to this crate.
pub fn init_logger_exe() {
    let name = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.file_stem().and_then(|s| s.to_str()).map(str::to_string))
        .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string());
    init_logger(name);
}

/// The named crate and this library default to `Debug`; `RUST_LOG` overrides either.
pub fn init_logger(name: impl Into<String>) {
    let crate_name = name.into().replace('-', "_");
    let overrides = std::env::var("RUST_LOG").ok();

    let _ = filtered_builder(&crate_name, overrides.as_deref())
        .format(move |f, rec| {
            let now = humantime::format_rfc3339_millis(std::time::SystemTime::now());
            let module = rec.module_path().unwrap_or("<unknown>");
            let line = rec.line().unwrap_or(u32::MIN);
            let level = rec.level();

            writeln!(
                f,
                "[{} {} {} {}:{}] {}",
                level,
                crate_name,
                now,
                module,
                line,
                rec.args()
            )
        })
        .try_init();
}

fn filtered_builder(crate_name: &str, overrides: Option<&str>) -> Builder {
    let mut builder = Builder::new();
    builder
        .filter(Some(crate_name), LevelFilter::Debug)
        .filter(Some(LIB_TARGET), LevelFilter::Debug);
    if let Some(spec) = overrides {
        builder.parse_filters(spec);
    }
    builder
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::{Level, Record};

    fn enabled(logger: &env_logger::Logger, target: &str, level: Level) -> bool {
        logger.matches(&Record::builder().target(target).level(level).build())
    }

    #[test]
    fn library_defaults_to_debug() {
        let logger = filtered_builder("tile_watch", None).build();
        assert!(enabled(&logger, "tile_watch::monitor", Level::Debug));
        assert!(!enabled(&logger, "tile_watch::monitor", Level::Trace));
        assert!(!enabled(&logger, "reqwest::connect", Level::Info));
    }

    #[test]
    fn rust_log_overrides_the_defaults() {
        let logger = filtered_builder("tile_watch", Some("tile_watch=warn")).build();
        assert!(!enabled(&logger, "tile_watch::monitor", Level::Info));
        assert!(enabled(&logger, "tile_watch::monitor", Level::Warn));
    }
}
