use sediment::ServiceConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut service = ServiceConfig::new(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    service.register_commands = Box::new(|_components, table| {
        key_value::register_commands(table);
    });
    sediment::run(service).await
}
