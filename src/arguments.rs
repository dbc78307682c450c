use {
    super::*,
    clap::builder::styling::{AnsiColor, Effects, Styles},
    options::Options,
};

#[derive(Debug, Parser)]
#[command(
  version,
  styles = Styles::styled()
    .error(AnsiColor::Red.on_default() | Effects::BOLD)
    .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
    .invalid(AnsiColor::Red.on_default())
    .literal(AnsiColor::Blue.on_default())
    .placeholder(AnsiColor::Cyan.on_default())
    .usage(AnsiColor::Yellow.on_default() | Effects::BOLD)
    .valid(AnsiColor::Green.on_default()),
)]
pub(crate) struct Arguments {
    #[command(flatten)]
    pub(crate) options: Options,
}

impl Arguments {
    pub(crate) fn run(self) -> Result {
        let config = Arc::new(Config::load(&self.options)?);

        Runtime::new()?.block_on(async {
            let cancel_token = CancellationToken::new();

            let shutdown_token = cancel_token.clone();
            tokio::spawn(async move {
                let _ = ctrl_c().await;
                info!("Received shutdown signal, stopping agent...");
                shutdown_token.cancel();
            });

            Agent::new(config).run(cancel_token).await
        })
    }
}
