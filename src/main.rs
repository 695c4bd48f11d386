use clap::Parser;
use wallpaper_picker::{Args, WallpaperPickerApp};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_WINDOW_WIDTH: f32 = 1000.0;
const DEFAULT_WINDOW_HEIGHT: f32 = 600.0;

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_filter = if args.debug {
        "wallpaper_picker=debug"
    } else {
        "wallpaper_picker=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_inner_size([DEFAULT_WINDOW_WIDTH, DEFAULT_WINDOW_HEIGHT])
            .with_title("Wallpaper Picker"),
        ..Default::default()
    };

    let result = eframe::run_native(
        "Wallpaper Picker",
        options,
        Box::new(|cc| {
            WallpaperPickerApp::new(cc, args)
                .map(|app| Box::new(app) as Box<dyn eframe::App>)
                .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)
        }),
    );

    match result {
        Ok(_) => Ok(()),
        Err(e) => Err(anyhow::anyhow!("Failed to run application: {:?}", e)),
    }
}
