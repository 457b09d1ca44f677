use std::env;
use std::sync::Arc;

use poise::serenity_prelude::{self as serenity};
use serenity::GatewayIntents;
use tracing::info;

use warden::expiry::{BanPunishment, BanStore, ExpiryScheduler, MutePunishment, MuteStore};
use warden::{Data, DataInner, Error, commands, config::ConfigStore, db, handlers, logging};

/// Main function to run the bot
async fn async_main() -> Result<(), Error> {
    logging::init()?;

    let token = env::var("DISCORD_TOKEN").expect("DISCORD_TOKEN must be set");
    let database_url =
        env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://data/warden.db".to_string());

    // The sqlite file and the guild config both live under data/
    tokio::fs::create_dir_all("data").await?;

    let pool = db::connect(&database_url).await?;
    db::migrate(&pool).await?;
    let configs = ConfigStore::load().await;
    info!("Loaded configuration for {} guild(s)", configs.len());

    let framework = poise::Framework::builder()
        .options(poise::FrameworkOptions {
            commands: vec![
                commands::ping(),
                commands::mute(),
                commands::unmute(),
                commands::tempban(),
                commands::unban(),
                commands::kick(),
                commands::verify(),
                commands::snipe(),
                commands::status(),
                commands::configure(),
            ],
            pre_command: |ctx| {
                Box::pin(async move {
                    logging::log_command_start(ctx);
                })
            },
            post_command: |ctx| {
                Box::pin(async move {
                    logging::log_command_end(ctx);
                })
            },
            on_error: |error| {
                Box::pin(async move {
                    logging::log_command_error(&error);
                })
            },
            ..Default::default()
        })
        .setup(move |ctx, _ready, framework| {
            Box::pin(async move {
                poise::builtins::register_globally(ctx, &framework.options().commands).await?;

                let mutes = MuteStore::new(pool.clone());
                let bans = BanStore::new(pool.clone());
                let snipes = warden::snipe::SnipeStore::new(pool.clone());

                let mute_source = Arc::new(MutePunishment::new(
                    mutes.clone(),
                    ctx.http.clone(),
                    configs.clone(),
                ));
                let ban_source = Arc::new(BanPunishment::new(bans.clone(), ctx.http.clone()));

                // Reconcile anything that expired while the bot was down,
                // then keep a timer armed for whatever is soonest. Commands
                // are not served until both schedulers are live.
                let mute_scheduler = ExpiryScheduler::initialize(mute_source.clone()).await?;
                let ban_scheduler = ExpiryScheduler::initialize(ban_source.clone()).await?;
                logging::log_console("Expiry schedulers initialized".to_string());

                let data = Data::new(DataInner {
                    pool,
                    configs,
                    mutes,
                    bans,
                    snipes,
                    mute_source,
                    ban_source,
                    mute_scheduler,
                    ban_scheduler,
                });

                // Gateway event handlers reach the state through the type map
                ctx.data.write().await.insert::<Data>(data.clone());
                Ok(data)
            })
        })
        .build();

    let intents = GatewayIntents::non_privileged()
        | GatewayIntents::MESSAGE_CONTENT
        | GatewayIntents::GUILD_MEMBERS;
    let mut client = serenity::ClientBuilder::new(token, intents)
        .event_handler(handlers::Handler)
        .framework(framework)
        .await
        .expect("Failed to create client");

    let data_map = client.data.clone();
    let shard_manager = client.shard_manager.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for ctrl-c");
        info!("Shutting down");
        if let Some(data) = data_map.read().await.get::<Data>().cloned() {
            data.mute_scheduler.stop().await;
            data.ban_scheduler.stop().await;
        }
        shard_manager.shutdown_all().await;
    });

    info!("Starting bot...");
    if let Err(err) = client.start().await {
        eprintln!("Error starting the bot: {}", err);
    }

    Ok(())
}

fn main() {
    let result = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(async_main());

    if let Err(err) = result {
        eprintln!("Error: {}", err);
    }
}
