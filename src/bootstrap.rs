use tracing::info;
use ulid::Ulid;

use crate::engine::{Engine, EngineError};
use crate::model::Caller;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSeed {
    pub id: Ulid,
    pub name: String,
    pub experience_years: u32,
    pub specialty: String,
}

impl ProviderSeed {
    fn new(n: u128, name: &str, experience_years: u32, specialty: &str) -> Self {
        Self {
            id: Ulid::from_parts(0, n),
            name: name.into(),
            experience_years,
            specialty: specialty.into(),
        }
    }
}

/// The starting roster. Ids are fixed so that re-seeding finds existing records.
pub fn default_providers() -> Vec<ProviderSeed> {
    vec![
        ProviderSeed::new(1, "Dr. Sarah Johnson", 12, "General Dentistry"),
        ProviderSeed::new(2, "Dr. Michael Chen", 8, "Orthodontics"),
        ProviderSeed::new(3, "Dr. Lisa Smith", 15, "Periodontics"),
        ProviderSeed::new(4, "Dr. Robert Williams", 10, "Endodontics"),
    ]
}

/// Create every seed provider that does not exist yet. Returns how many were created.
pub async fn seed_providers(engine: &Engine, seeds: &[ProviderSeed]) -> Result<usize, EngineError> {
    // Seeding runs on behalf of the system, not a logged-in user.
    let system = Caller::admin(Ulid::nil());
    let mut created = 0;
    for seed in seeds {
        match engine
            .create_provider(
                &system,
                seed.id,
                seed.name.clone(),
                seed.experience_years,
                seed.specialty.clone(),
            )
            .await
        {
            Ok(_) => created += 1,
            Err(EngineError::AlreadyExists(_)) => {}
            Err(e) => return Err(e),
        }
    }
    if created > 0 {
        info!("seeded {created} providers");
    }
    Ok(created)
}
