use anyhow::Result;
use std::sync::Arc;
use tracing::{error, info};
use voltaic::{Config, Runtime};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;
    voltaic::logging::init_logging(&config.logging)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    info!("Voltaic {} starting up", env!("APP_VERSION"));

    let runtime = Runtime::from_config(&config)
        .map_err(|e| anyhow::anyhow!("Failed to build runtime: {}", e))?;
    let config = Arc::new(config);

    #[cfg(feature = "web")]
    let web_task = config.web.enabled.then(|| {
        let handle = runtime.handle();
        let web_config = Arc::clone(&config);
        tokio::spawn(async move {
            if let Err(e) = voltaic::web::serve(handle, web_config).await {
                error!("Web server error: {}", e);
            }
        })
    });

    let outcome = runtime.run().await;

    #[cfg(feature = "web")]
    if let Some(task) = web_task {
        task.abort();
    }

    match outcome {
        Ok(()) => {
            info!("Runtime shutdown complete");
            Ok(())
        }
        Err(e) => {
            error!("Runtime failed with error: {}", e);
            Err(anyhow::anyhow!("Runtime error: {}", e))
        }
    }
}
