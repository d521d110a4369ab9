use anyhow::{Context, Result};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use voice_trigger::audio::CpalMicrophone;
use voice_trigger::config::Config;
use voice_trigger::{
    telemetry, transcription, CaptureError, CommandAction, EngineSettings, Trigger,
    TriggerRegistry, VoiceEngine,
};

fn build_registry() -> Result<TriggerRegistry> {
    let mut registry = TriggerRegistry::new();

    registry.register(
        Trigger::new(
            ["hello", "hi", "hey", "how are you"],
            CommandAction::immediate(|transcript| {
                println!("Hello there! (heard: {transcript:?})");
                Ok(())
            }),
        )
        .with_priority(1),
    )?;

    registry.register(
        Trigger::new(
            ["what's the weather", "weather"],
            CommandAction::modal(|_, ctx| {
                println!("Which city?");
                match ctx.recognize(Duration::from_secs(5)) {
                    Ok(Some(city)) => println!("It's always sunny in {city}."),
                    Ok(None) => println!("Sorry, I couldn't understand that."),
                    Err(CaptureError::NoSpeechTimeout(_)) => println!("No city heard."),
                    Err(e) => return Err(e.into()),
                }
                Ok(())
            }),
        )
        .with_priority(2)
        .on_wait_start(|| println!("..."))
        .on_wait_end(|| println!("ok")),
    )?;

    Ok(registry)
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    telemetry::init(&config.telemetry)?;
    tracing::info!("voice-trigger starting");

    let microphone = CpalMicrophone::new(&config.audio).context("failed to open microphone")?;
    let speech = transcription::from_config(&config.transcription)?;
    let registry = build_registry()?;

    let mut engine = VoiceEngine::new(
        EngineSettings::from(&config.engine),
        registry,
        Box::new(microphone),
        speech,
    );
    engine.start()?;

    println!("Voice Trigger is running. Say \"hello\" or \"what's the weather\".");
    println!("Type a phrase to fire it manually, \"mute\"/\"unmute\" to toggle listening.");
    println!("Press Ctrl+C to exit.\n");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown signal received");
                println!("\nShutting down...");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                match line.trim() {
                    "" => {}
                    "mute" => engine.set_background_listening_enabled(false),
                    "unmute" => engine.set_background_listening_enabled(true),
                    phrase => {
                        if let Err(e) = engine.trigger(phrase) {
                            println!("{e}");
                        }
                    }
                }
            }
        }
    }

    // Joining the workers blocks, keep it off the runtime threads
    tokio::task::spawn_blocking(move || engine.stop()).await?;
    Ok(())
}
