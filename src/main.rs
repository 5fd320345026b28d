fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let config = storewatch::StorewatchConfiguration::build_default()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async move {
            config.install_tracing()?.install_metrics()?.run().await
        })
}
