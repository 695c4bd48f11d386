use crate::cache::PreviewKey;
use crate::coordinator::{PreviewConfig, PreviewCoordinator, PreviewSink, PreviewUpdate};
use crate::decoder::ImageDecoder;
use crate::error::Result;
use crate::{
    save_selected_image, scan_images, set_background, validate_command, wrap_index, Args, WallpaperEntry,
};
use eframe::egui;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

const LIST_PANEL_WIDTH: f32 = 300.0;

// Forwards updates to the UI thread and wakes it up to apply them
struct RepaintSink {
    sender: mpsc::UnboundedSender<PreviewUpdate>,
    ctx: egui::Context,
}

impl PreviewSink for RepaintSink {
    fn deliver(&self, update: PreviewUpdate) {
        if self.sender.send(update).is_ok() {
            self.ctx.request_repaint();
        }
    }
}

/// List navigation triggered from the keyboard.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListShortcut {
    Previous,
    Next,
    Activate,
}

/// Maps this frame's key presses to a list action. Keys typed into a text
/// field belong to that field, so nothing fires while one has focus.
pub fn list_shortcut(input: &egui::InputState, text_has_focus: bool) -> Option<ListShortcut> {
    if text_has_focus {
        return None;
    }
    if input.key_pressed(egui::Key::ArrowUp) {
        Some(ListShortcut::Previous)
    } else if input.key_pressed(egui::Key::ArrowDown) {
        Some(ListShortcut::Next)
    } else if input.key_pressed(egui::Key::Enter) {
        Some(ListShortcut::Activate)
    } else {
        None
    }
}

enum PreviewPane {
    Placeholder,
    Loading(Option<egui::TextureHandle>),
    Showing(egui::TextureHandle),
}

pub struct WallpaperPickerApp {
    args: Args,
    directory_input: String,
    wallpapers: Vec<WallpaperEntry>,
    selected: Option<usize>,
    status: String,
    coordinator: PreviewCoordinator,
    updates: mpsc::UnboundedReceiver<PreviewUpdate>,
    pane: PreviewPane,
}

impl WallpaperPickerApp {
    pub fn new(cc: &eframe::CreationContext<'_>, args: Args) -> Result<Self> {
        validate_command(&args.command)?;

        let (sender, updates) = mpsc::unbounded_channel();
        let sink = Arc::new(RepaintSink {
            sender,
            ctx: cc.egui_ctx.clone(),
        });
        let coordinator =
            PreviewCoordinator::new(PreviewConfig::from(&args), Arc::new(ImageDecoder::new()), sink)?;

        let mut app = Self {
            directory_input: args.directory.to_string_lossy().into_owned(),
            args,
            wallpapers: Vec::new(),
            selected: None,
            status: String::new(),
            coordinator,
            updates,
            pane: PreviewPane::Placeholder,
        };
        app.refresh_wallpapers();
        Ok(app)
    }

    fn refresh_wallpapers(&mut self) {
        self.status = "Loading wallpapers...".to_owned();
        self.selected = None;

        match scan_images(&self.args.directory, self.args.recursive) {
            Ok(wallpapers) => {
                self.wallpapers = wallpapers;
                self.status = format!("Found {} wallpapers", self.wallpapers.len());
                if self.wallpapers.is_empty() {
                    self.coordinator.clear();
                } else {
                    self.select(0);
                }
            }
            Err(e) => {
                warn!("{}", e);
                self.wallpapers.clear();
                self.coordinator.clear();
                self.status = format!("Error loading wallpapers: {}", e);
            }
        }
    }

    fn change_directory(&mut self) {
        let directory = PathBuf::from(self.directory_input.trim());
        info!("Changing wallpaper directory to {:?}", directory);
        self.args.directory = directory;
        self.refresh_wallpapers();
    }

    fn select(&mut self, index: usize) {
        let Some(wallpaper) = self.wallpapers.get(index) else {
            return;
        };
        self.selected = Some(index);
        self.status = format!("Selected wallpaper: {}", wallpaper.name);
        self.coordinator.select(PreviewKey::new(&wallpaper.path));

        // Warm the cache for the entry the user is most likely to look at next
        if let Some(next) = self.wallpapers.get(index + 1) {
            self.coordinator.preload(PreviewKey::new(&next.path));
        }
    }

    fn navigate(&mut self, delta: isize) {
        let next = wrap_index(self.selected, delta, self.wallpapers.len());
        if let Some(next) = next.filter(|&next| Some(next) != self.selected) {
            self.select(next);
        }
    }

    fn set_current_wallpaper(&mut self) {
        let Some(wallpaper) = self.selected.and_then(|i| self.wallpapers.get(i)) else {
            return;
        };

        let result = set_background(self.args.pre_command(), &self.args.command, &wallpaper.path)
            .and_then(|_| save_selected_image(&self.args.selected_image_path(), &wallpaper.path));

        self.status = match result {
            Ok(()) => format!("Wallpaper set: {}", wallpaper.name),
            Err(e) => {
                warn!("Failed to set wallpaper {:?}: {}", wallpaper.path, e);
                format!("Error setting wallpaper: {}", e)
            }
        };
    }

    fn process_preview_updates(&mut self, ctx: &egui::Context) {
        while let Ok(update) = self.updates.try_recv() {
            let previous = std::mem::replace(&mut self.pane, PreviewPane::Placeholder);
            self.pane = match update {
                PreviewUpdate::Loading => match previous {
                    PreviewPane::Showing(texture) | PreviewPane::Loading(Some(texture)) => {
                        PreviewPane::Loading(Some(texture))
                    }
                    _ => PreviewPane::Loading(None),
                },
                PreviewUpdate::Image(image) => {
                    let color_image = egui::ColorImage::from_rgba_unmultiplied(
                        [image.width() as usize, image.height() as usize],
                        image.pixels(),
                    );
                    PreviewPane::Showing(ctx.load_texture("preview", color_image, egui::TextureOptions::LINEAR))
                }
                PreviewUpdate::Placeholder => PreviewPane::Placeholder,
                PreviewUpdate::Failed(reason) => {
                    self.status = format!("Preview unavailable: {}", reason);
                    // Fall back to whatever was on screen before loading began
                    match previous {
                        PreviewPane::Loading(Some(texture)) | PreviewPane::Showing(texture) => {
                            PreviewPane::Showing(texture)
                        }
                        _ => PreviewPane::Placeholder,
                    }
                }
            };
        }
    }

    fn show_list(&mut self, ui: &mut egui::Ui) {
        ui.heading("Wallpapers");
        ui.horizontal(|ui| {
            let response = ui.text_edit_singleline(&mut self.directory_input);
            let submitted = response.lost_focus() && ui.input(|i| i.key_pressed(egui::Key::Enter));
            if submitted || ui.button("Change Folder").clicked() {
                self.change_directory();
            }
        });
        ui.horizontal(|ui| {
            if ui.button("Set as Wallpaper").clicked() {
                self.set_current_wallpaper();
            }
            if ui.button("Refresh").clicked() {
                self.refresh_wallpapers();
            }
        });
        ui.separator();

        let mut clicked = None;
        egui::ScrollArea::vertical().show(ui, |ui| {
            for (index, wallpaper) in self.wallpapers.iter().enumerate() {
                let response = ui
                    .selectable_label(self.selected == Some(index), &wallpaper.name)
                    .on_hover_text(&wallpaper.relative_path);
                if response.clicked() {
                    clicked = Some(index);
                }
            }
        });

        if let Some(index) = clicked {
            if Some(index) != self.selected {
                self.select(index);
            }
        }
    }

    fn show_preview(&self, ui: &mut egui::Ui) {
        match &self.pane {
            PreviewPane::Placeholder => {
                ui.centered_and_justified(|ui| {
                    ui.label("No preview available");
                });
            }
            PreviewPane::Loading(texture) => {
                ui.horizontal(|ui| {
                    ui.spinner();
                    ui.label("Loading...");
                });
                if let Some(texture) = texture {
                    ui.add(egui::Image::new(texture).shrink_to_fit());
                }
            }
            PreviewPane::Showing(texture) => {
                ui.centered_and_justified(|ui| {
                    ui.add(egui::Image::new(texture).shrink_to_fit());
                });
            }
        }
    }
}

impl eframe::App for WallpaperPickerApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        self.process_preview_updates(ctx);

        let text_has_focus = ctx.wants_keyboard_input();
        match ctx.input(|i| list_shortcut(i, text_has_focus)) {
            Some(ListShortcut::Previous) => self.navigate(-1),
            Some(ListShortcut::Next) => self.navigate(1),
            Some(ListShortcut::Activate) => self.set_current_wallpaper(),
            None => {}
        }

        let cache_stats = self.coordinator.cache().stats();
        egui::TopBottomPanel::bottom("status").show(ctx, |ui| {
            ui.horizontal(|ui| {
                ui.label(&self.status);
                ui.with_layout(egui::Layout::right_to_left(egui::Align::Center), |ui| {
                    ui.label(cache_stats.to_string());
                });
            });
        });

        egui::SidePanel::left("wallpaper_list")
            .default_width(LIST_PANEL_WIDTH)
            .resizable(true)
            .show(ctx, |ui| self.show_list(ui));

        egui::CentralPanel::default().show(ctx, |ui| {
            ui.heading("Preview");
            ui.separator();
            self.show_preview(ui);
        });
    }
}
