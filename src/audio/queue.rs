use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use super::track::Track;

/// Cola de reproducción FIFO con punteros `current` y `previous`.
///
/// Los elementos consumidos por `dequeue` no se eliminan inmediatamente: se
/// avanza un offset y la parte consumida solo se compacta cuando el offset
/// alcanza la mitad de la longitud física. El orden de salida siempre es el
/// de inserción.
#[derive(Debug, Clone)]
pub struct TrackQueue<U> {
    // Los huecos por debajo de `offset` ya fueron consumidos (`None`)
    tracks: Vec<Option<Track<U>>>,
    offset: usize,
    pub current: Option<Track<U>>,
    pub previous: Option<Track<U>>,
}

impl<U> Default for TrackQueue<U> {
    fn default() -> Self {
        Self {
            tracks: Vec::new(),
            offset: 0,
            current: None,
            previous: None,
        }
    }
}

impl<U: Clone> TrackQueue<U> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restaura una cola a partir de los tracks pendientes de un snapshot
    pub fn from_tracks(tracks: Vec<Track<U>>) -> Self {
        Self {
            tracks: tracks.into_iter().map(Some).collect(),
            ..Self::default()
        }
    }

    /// Número de tracks pendientes
    pub fn len(&self) -> usize {
        self.tracks.len() - self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Agrega un track al final
    pub fn enqueue(&mut self, track: Track<U>) {
        self.tracks.push(Some(track));
    }

    /// Agrega varios tracks (playlist)
    pub fn enqueue_many(&mut self, tracks: impl IntoIterator<Item = Track<U>>) -> usize {
        let before = self.len();
        self.tracks.extend(tracks.into_iter().map(Some));
        let added = self.len() - before;
        info!("➕ Agregadas {} canciones a la cola", added);
        added
    }

    /// Agrega un track para que sea el siguiente en sonar
    pub fn enqueue_next(&mut self, track: Track<U>) {
        self.tracks.insert(self.offset, Some(track));
    }

    /// Obtiene el siguiente track (FIFO)
    pub fn dequeue(&mut self) -> Option<Track<U>> {
        let track = self.tracks.get_mut(self.offset)?.take();
        self.offset += 1;

        if self.offset * 2 >= self.tracks.len() {
            self.tracks.drain(..self.offset);
            self.offset = 0;
        }

        track
    }

    /// Track en la posición lógica `index` sin consumirlo
    pub fn peek(&self, index: usize) -> Option<&Track<U>> {
        self.tracks.get(self.offset + index)?.as_ref()
    }

    /// Rango lógico `[start, end)` de tracks pendientes, recortado a lo disponible
    pub fn slice(&self, start: usize, end: Option<usize>) -> Vec<&Track<U>> {
        let (start, end) = self.clamp_range(start, end);
        self.tracks[start..end].iter().flatten().collect()
    }

    /// Elimina el track en la posición lógica `index`
    pub fn remove(&mut self, index: usize) -> Option<Track<U>> {
        if index >= self.len() {
            return None;
        }
        let removed = self.tracks.remove(self.offset + index);
        debug!("❌ Track eliminado en posición {}", index);
        removed
    }

    /// Elimina el rango lógico `[start, end)` y devuelve los tracks quitados
    pub fn remove_range(&mut self, start: usize, end: Option<usize>) -> Vec<Track<U>> {
        let (start, end) = self.clamp_range(start, end);
        let removed: Vec<_> = self.tracks.drain(start..end).flatten().collect();
        if !removed.is_empty() {
            info!("🗑️ Eliminadas {} canciones de la cola", removed.len());
        }
        removed
    }

    /// Mueve un track a una nueva posición
    pub fn move_track(&mut self, from: usize, to: usize) -> bool {
        if from >= self.len() || to >= self.len() {
            return false;
        }
        if from != to {
            let track = self.tracks.remove(self.offset + from);
            self.tracks.insert(self.offset + to, track);
            debug!("📍 Track movido de posición {} a {}", from, to);
        }
        true
    }

    /// Mezcla los tracks pendientes (Fisher–Yates); los consumidos no se tocan
    pub fn shuffle(&mut self) {
        self.compact();

        match self.tracks.len() {
            0 | 1 => {}
            2 => self.tracks.swap(0, 1),
            len => {
                let mut rng = rand::thread_rng();
                for i in (1..len).rev() {
                    let j = rng.gen_range(0..=i);
                    self.tracks.swap(i, j);
                }
            }
        }
        info!("🔀 Cola mezclada");
    }

    /// Limpia los tracks pendientes
    pub fn clear(&mut self) {
        self.tracks.clear();
        self.offset = 0;
        info!("🗑️ Cola limpiada");
    }

    pub fn iter(&self) -> impl Iterator<Item = &Track<U>> {
        self.tracks[self.offset..].iter().flatten()
    }

    /// Copia de los tracks pendientes, en orden
    pub fn to_vec(&self) -> Vec<Track<U>> {
        self.iter().cloned().collect()
    }

    /// Duración de los pendientes más el actual (los streams no cuentan)
    pub fn total_duration(&self) -> Duration {
        self.iter()
            .chain(self.current.iter())
            .filter_map(Track::duration)
            .sum()
    }

    fn compact(&mut self) {
        if self.offset > 0 {
            self.tracks.drain(..self.offset);
            self.offset = 0;
        }
    }

    fn clamp_range(&self, start: usize, end: Option<usize>) -> (usize, usize) {
        let len = self.len();
        let end = end.unwrap_or(len).min(len);
        let start = start.min(end);
        (self.offset + start, self.offset + end)
    }
}

/// Vista serializable de la cola para los snapshots
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(deserialize = "U: Deserialize<'de>"))]
pub struct QueueState<U> {
    #[serde(default = "Vec::new")]
    pub tracks: Vec<Track<U>>,
    #[serde(default)]
    pub current: Option<Track<U>>,
    #[serde(default)]
    pub previous: Option<Track<U>>,
}

impl<U: Clone> From<&TrackQueue<U>> for QueueState<U> {
    fn from(queue: &TrackQueue<U>) -> Self {
        Self {
            tracks: queue.to_vec(),
            current: queue.current.clone(),
            previous: queue.previous.clone(),
        }
    }
}

impl<U: Clone> From<QueueState<U>> for TrackQueue<U> {
    fn from(state: QueueState<U>) -> Self {
        let mut queue = TrackQueue::from_tracks(state.tracks);
        queue.current = state.current;
        queue.previous = state.previous;
        queue
    }
}
