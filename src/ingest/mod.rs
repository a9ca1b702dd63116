/// Upstream API clients.
///
/// Each data source gets its own file here. Only Open-Meteo exists today.
pub mod open_meteo;

#[cfg(test)]
pub(crate) mod fixtures;
