use quizlive::audio::{list_devices, DeviceKind, DeviceType, MicSource, PulseMic, PulseSpeaker, SpeakerSink};
use quizlive::config::{
    AppConfig, CAPTURE_FRAME_SAMPLES, INPUT_SAMPLE_RATE, OUTPUT_CHANNELS, OUTPUT_SAMPLE_RATE,
    RENDER_BLOCK_FRAMES,
};
use quizlive::spectrum::rms;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Device names from the environment, if any; the API key is not needed here
    let (input_device, output_device) = match AppConfig::from_lookup(|name| match name {
        "GEMINI_API_KEY" => Some("unused".to_string()),
        _ => std::env::var(name).ok(),
    }) {
        Ok(config) => (config.input_device, config.output_device),
        Err(e) => {
            println!("Ignoring configuration: {}", e);
            (None, None)
        }
    };

    println!("Available audio devices:");
    match list_devices(DeviceType::Any) {
        Ok(devices) if devices.is_empty() => println!("No audio devices found!"),
        Ok(devices) => {
            for (i, device) in devices.iter().enumerate() {
                let kind = match device.kind {
                    DeviceKind::Microphone => "Microphone",
                    DeviceKind::Monitor => "Monitor",
                    DeviceKind::Output => "Output",
                };
                println!("{}: {} ({})", i + 1, device.description, kind);
                println!("   Name: {}", device.name);
                println!(
                    "   Rate: {} Hz, Channels: {}",
                    device.sample_rate, device.channels
                );
                println!();
            }
        }
        Err(e) => println!("Error listing devices: {}", e),
    }

    println!(
        "\nTesting capture at {} Hz on {}...",
        INPUT_SAMPLE_RATE,
        input_device.as_deref().unwrap_or("default input")
    );
    let capture_ok = match PulseMic::open("quizlive-check", input_device.as_deref()) {
        Ok(mut mic) => {
            let mut frame = vec![0.0f32; CAPTURE_FRAME_SAMPLES];
            match mic.read_frame(&mut frame) {
                Ok(()) => {
                    println!("  ✅ Read one frame, level {:.4}", rms(&frame));
                    true
                }
                Err(e) => {
                    println!("  ❌ Read failed: {}", e);
                    false
                }
            }
        }
        Err(e) => {
            println!("  ❌ Failed: {}", e);
            false
        }
    };

    println!(
        "\nTesting playback at {} Hz on {}...",
        OUTPUT_SAMPLE_RATE,
        output_device.as_deref().unwrap_or("default output")
    );
    let playback_ok = match PulseSpeaker::open(
        "quizlive-check",
        output_device.as_deref(),
        OUTPUT_SAMPLE_RATE,
        OUTPUT_CHANNELS,
    ) {
        Ok(mut speaker) => {
            let silence = vec![0.0f32; RENDER_BLOCK_FRAMES * OUTPUT_CHANNELS as usize];
            match speaker.write_block(&silence).and_then(|_| speaker.flush()) {
                Ok(()) => {
                    println!("  ✅ Wrote one block");
                    true
                }
                Err(e) => {
                    println!("  ❌ Write failed: {}", e);
                    false
                }
            }
        }
        Err(e) => {
            println!("  ❌ Failed: {}", e);
            false
        }
    };

    println!("\nAudio device check complete!");
    if capture_ok && playback_ok {
        Ok(())
    } else {
        Err(anyhow::anyhow!("audio devices are not ready"))
    }
}
