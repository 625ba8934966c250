//! Command execution: device listing and gapless playlist playback.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use audio_engine::{CpalBinding, Engine, EngineEvent, EventReceiver, SourceRef};
use crossbeam_channel::{Receiver, select};

use crate::config::PlayerConfig;
use crate::source::FileSource;

pub fn devices() -> Result<()> {
    let devices = audio_engine::output::output_devices()?;
    if devices.is_empty() {
        println!("no output devices");
    }
    for d in devices {
        let marker = if d.is_default { "*" } else { " " };
        println!("{marker} {} ({}-{} Hz)", d.name, d.min_rate, d.max_rate);
    }
    Ok(())
}

/// A playlist entry that opened successfully.
struct Track {
    label: String,
    source: SourceRef,
}

impl Track {
    fn is(&self, source: &SourceRef) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.source), Arc::as_ptr(source))
    }
}

/// Files still to be played, opened lazily one at a time.
struct Playlist {
    paths: std::vec::IntoIter<PathBuf>,
}

impl Playlist {
    fn new(paths: Vec<PathBuf>) -> Self {
        Self {
            paths: paths.into_iter(),
        }
    }

    /// Open the next playable file, skipping the ones that fail to open.
    fn open_next(&mut self) -> Option<Track> {
        for path in self.paths.by_ref() {
            match FileSource::open(&path) {
                Ok(source) => {
                    let label = source.label().to_string();
                    return Some(Track {
                        label,
                        source: Arc::new(source),
                    });
                }
                Err(err) => tracing::warn!(path = %path.display(), "skipping: {err:#}"),
            }
        }
        None
    }
}

pub fn play(cfg: &PlayerConfig, paths: Vec<PathBuf>) -> Result<()> {
    let binding = CpalBinding::open(cfg.device.as_deref())?;
    let (engine, events) =
        Engine::start(Box::new(binding), cfg.engine.clone()).context("start audio engine")?;
    engine.set_volume_millibels(cfg.volume_mb);

    let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
    ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    })
    .context("install Ctrl-C handler")?;

    let result = PlaylistPlayer::new(&engine, Playlist::new(paths)).run(&events, &stop_rx);
    engine.shutdown();
    result
}

struct PlaylistPlayer<'a> {
    engine: &'a Engine,
    playlist: Playlist,
    current: Option<Track>,
    next: Option<Track>,
    /// The engine accepted `next` for a gapless transition.
    gapless: bool,
}

impl<'a> PlaylistPlayer<'a> {
    fn new(engine: &'a Engine, playlist: Playlist) -> Self {
        Self {
            engine,
            playlist,
            current: None,
            next: None,
            gapless: false,
        }
    }

    fn run(mut self, events: &EventReceiver, stop: &Receiver<()>) -> Result<()> {
        let first = self
            .playlist
            .open_next()
            .ok_or_else(|| anyhow!("no playable files"))?;
        self.start(first)?;

        while self.current.is_some() {
            select! {
                recv(stop) -> _ => {
                    tracing::info!("interrupted");
                    if let Some(track) = &self.current {
                        self.engine.reset(&track.source)?;
                    }
                    return Ok(());
                }
                recv(events.channel()) -> msg => {
                    let Ok(event) = msg else {
                        return Err(anyhow!("audio engine stopped"));
                    };
                    events.dispatch(&event);
                    self.handle(&event)?;
                }
            }
        }
        tracing::info!("playlist finished");
        Ok(())
    }

    fn handle(&mut self, event: &EngineEvent) -> Result<()> {
        let is_current = self.current.as_ref().is_some_and(|t| t.is(event.source()));
        let is_next = self.next.as_ref().is_some_and(|t| t.is(event.source()));
        match event {
            EngineEvent::Completion(_) if is_current => self.advance(),
            EngineEvent::Error { .. } if is_current => {
                self.gapless = false;
                self.advance()
            }
            EngineEvent::Error { .. } if is_next => {
                tracing::info!("next track dropped from gapless queue");
                self.gapless = false;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Move on after the current track ended or failed.
    fn advance(&mut self) -> Result<()> {
        self.current = None;
        let Some(next) = self.next.take() else {
            return Ok(());
        };
        if self.gapless {
            tracing::info!(track = %next.label, "now playing");
            self.current = Some(next);
            self.queue_following()
        } else {
            self.start(next)
        }
    }

    fn start(&mut self, track: Track) -> Result<()> {
        tracing::info!(track = %track.label, "now playing");
        if let Err(err) = self.engine.play(&track.source) {
            tracing::error!(track = %track.label, error = %err, "play failed");
            return match self.playlist.open_next() {
                Some(following) => self.start(following),
                None => Ok(()),
            };
        }
        self.current = Some(track);
        self.queue_following()
    }

    fn queue_following(&mut self) -> Result<()> {
        let (Some(current), Some(following)) = (&self.current, self.playlist.open_next()) else {
            self.gapless = false;
            return Ok(());
        };
        self.engine
            .set_next(&current.source, Some(&following.source))?;
        self.gapless = self.engine.status().has_next;
        if !self.gapless {
            tracing::info!(track = %following.label, "queued without gapless transition");
        }
        self.next = Some(following);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::tests::write_wav;

    #[test]
    fn playlist_skips_files_that_fail_to_open() {
        let good = write_wav("playlist", 8_000, 1, 100);
        let mut playlist = Playlist::new(vec![
            PathBuf::from("/nonexistent/a.flac"),
            good.clone(),
            PathBuf::from("/nonexistent/b.flac"),
        ]);

        let track = playlist.open_next().unwrap();
        assert!(track.label.ends_with("playlist.wav"));
        assert!(playlist.open_next().is_none());
        let _ = std::fs::remove_file(good);
    }

    #[test]
    fn track_identity_is_by_allocation() {
        let path = write_wav("identity", 8_000, 1, 100);
        let mut playlist = Playlist::new(vec![path.clone(), path.clone()]);
        let a = playlist.open_next().unwrap();
        let b = playlist.open_next().unwrap();
        assert!(a.is(&a.source));
        assert!(!a.is(&b.source));
        let _ = std::fs::remove_file(path);
    }
}
