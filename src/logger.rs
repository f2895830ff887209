use data::log;

const WORKSPACE_CRATES: [&str; 3] = ["insight", "data", "feed"];

pub fn setup(is_debug: bool) -> Result<(), fern::InitError> {
    let own_level = if is_debug {
        ::log::LevelFilter::Debug
    } else {
        ::log::LevelFilter::Info
    };

    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{} [{}] {}: {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                message
            ));
        })
        .level(::log::LevelFilter::Warn);

    for krate in WORKSPACE_CRATES {
        dispatch = dispatch.level_for(krate, own_level);
    }

    let dispatch = dispatch.chain(std::io::stdout());

    match log::file() {
        Ok(file) => dispatch.chain(file).apply()?,
        Err(e) => {
            dispatch.apply()?;
            ::log::warn!("File logging disabled: {e}");
        }
    }

    Ok(())
}
