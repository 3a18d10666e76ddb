use anyhow::Result;
use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serenity::model::id::GuildId;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{error, info, warn};

/// Clave del snapshot de un player
pub fn player_key(address: &str, guild_id: GuildId) -> String {
    format!("{}{}", player_prefix(address), guild_id)
}

/// Prefijo común a todos los snapshots de un nodo
pub fn player_prefix(address: &str) -> String {
    format!("player:state:{address}:")
}

/// Clave del último session id conocido de un nodo
pub fn session_key(address: &str) -> String {
    format!("lavalink:session:{address}")
}

/// Extrae el guild id del final de una clave de snapshot
pub fn guild_from_key(key: &str) -> Option<GuildId> {
    key.rsplit(':')
        .next()?
        .parse::<u64>()
        .ok()
        .filter(|id| *id != 0)
        .map(GuildId::new)
}

/// Almacén clave/valor durable para snapshots y sesiones.
///
/// Última escritura gana; solo el nodo dueño escribe cada clave.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: String) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    /// Todas las claves que empiezan por `prefix`
    async fn keys(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Almacén en memoria (tests y despliegues sin persistencia)
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect())
    }
}

/// Entrada tal como se guarda en disco
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEntry {
    key: String,
    value: String,
}

/// Almacén basado en archivos JSON, uno por clave
pub struct JsonStore {
    state_dir: PathBuf,
    cache: DashMap<String, String>,
}

impl JsonStore {
    pub async fn new(data_dir: PathBuf) -> Result<Self> {
        let state_dir = data_dir.join("state");
        fs::create_dir_all(&state_dir).await?;

        info!("📁 Storage inicializado en: {}", state_dir.display());

        let store = Self {
            state_dir,
            cache: DashMap::new(),
        };

        // Cargar entradas existentes
        store.load_all().await?;

        Ok(store)
    }

    /// Obtiene estadísticas de almacenamiento
    pub async fn stats(&self) -> Result<StorageStats> {
        let mut files = fs::read_dir(&self.state_dir).await?;
        let mut file_count = 0;
        let mut total_size = 0;

        while let Some(entry) = files.next_entry().await? {
            if entry.path().extension().map_or(false, |ext| ext == "json") {
                file_count += 1;
                if let Ok(metadata) = entry.metadata().await {
                    total_size += metadata.len();
                }
            }
        }

        Ok(StorageStats {
            entries: file_count,
            cached_entries: self.cache.len(),
            total_size_bytes: total_size,
            state_dir: self.state_dir.clone(),
        })
    }

    /// Elimina todas las entradas bajo un prefijo (p. ej. un nodo retirado)
    pub async fn cleanup_prefix(&self, prefix: &str) -> Result<usize> {
        let mut removed_count = 0;
        for key in self.keys(prefix).await? {
            match self.delete(&key).await {
                Ok(()) => removed_count += 1,
                Err(e) => error!("Error eliminando entrada {}: {}", key, e),
            }
        }
        if removed_count > 0 {
            info!("🗑️ Eliminadas {} entradas con prefijo {}", removed_count, prefix);
        }
        Ok(removed_count)
    }

    // Métodos privados

    async fn load_all(&self) -> Result<()> {
        let mut files = fs::read_dir(&self.state_dir).await?;
        let mut loaded_count = 0;

        while let Some(entry) = files.next_entry().await? {
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }

            match read_entry(&path).await {
                Ok(stored) => {
                    self.cache.insert(stored.key, stored.value);
                    loaded_count += 1;
                }
                Err(e) => warn!("Error cargando {}: {}", path.display(), e),
            }
        }

        if loaded_count > 0 {
            info!("📂 Cargadas {} entradas de estado", loaded_count);
        }

        Ok(())
    }

    fn file_path(&self, key: &str) -> PathBuf {
        self.state_dir
            .join(format!("{}.json", URL_SAFE_NO_PAD.encode(key)))
    }
}

async fn read_entry(path: &Path) -> Result<StoredEntry> {
    let content = fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&content)?)
}

#[async_trait]
impl StateStore for JsonStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.cache.get(key).map(|v| v.value().clone()))
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        let stored = StoredEntry {
            key: key.to_string(),
            value,
        };
        let content = serde_json::to_string(&stored)?;
        fs::write(self.file_path(key), content).await?;
        self.cache.insert(stored.key, stored.value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.cache.remove(key);
        match fs::remove_file(self.file_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .cache
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect())
    }
}

/// Estadísticas de almacenamiento
#[derive(Debug)]
pub struct StorageStats {
    pub entries: usize,
    pub cached_entries: usize,
    pub total_size_bytes: u64,
    pub state_dir: PathBuf,
}

impl std::fmt::Display for StorageStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "📊 Storage Stats:\n\
             📁 State Directory: {}\n\
             📝 Entries: {} files\n\
             💾 Cached: {} in memory\n\
             📦 Total Size: {} bytes ({:.2} KB)",
            self.state_dir.display(),
            self.entries,
            self.cached_entries,
            self.total_size_bytes,
            self.total_size_bytes as f64 / 1024.0
        )
    }
}
