use anyhow::Result;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::matching::{alias_within, match_names, word_count, MatchConfidence};
use crate::cache::Cache;
use crate::db::models::{TeamAlias, TeamId};
use crate::db::Repository;

/// Cache key for a provider team mapping.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MappingKey {
    pub provider: String,
    pub provider_team_id: String,
    pub league: String,
}

impl MappingKey {
    pub fn new(provider: &str, provider_team_id: &str, league: &str) -> Self {
        MappingKey {
            provider: provider.to_string(),
            provider_team_id: provider_team_id.to_string(),
            league: league.to_string(),
        }
    }
}

/// Maps provider team identifiers onto durable canonical team ids.
pub struct IdentityResolver {
    repo: Arc<dyn Repository>,
    cache: Arc<dyn Cache<MappingKey, TeamId>>,
}

impl IdentityResolver {
    pub fn new(repo: Arc<dyn Repository>, cache: Arc<dyn Cache<MappingKey, TeamId>>) -> Self {
        IdentityResolver { repo, cache }
    }

    /// Resolve a provider team to a canonical team id, creating the team on
    /// first sighting.
    ///
    /// Order: existing provider mapping, then a confident alias match against
    /// the league's known names, then a brand-new team. Safe under concurrent
    /// calls for the same provider team: the loser of a mapping race gets the
    /// winner's team id.
    pub fn resolve_or_create_team(
        &self,
        league: &str,
        provider: &str,
        provider_team_id: &str,
        provider_team_name: &str,
        abbreviation: Option<&str>,
    ) -> Result<TeamId> {
        let key = MappingKey::new(provider, provider_team_id, league);
        if let Some(team_id) = self.cache.get(&key) {
            return Ok(team_id);
        }

        if let Some(mapping) = self
            .repo
            .find_team_mapping(provider, provider_team_id, league)?
        {
            if mapping.raw_name != provider_team_name {
                self.repo.refresh_team_mapping_name(
                    provider,
                    provider_team_id,
                    league,
                    provider_team_name,
                )?;
            }
            self.cache.insert(key, mapping.team_id);
            return Ok(mapping.team_id);
        }

        let team_id = match self.match_alias(league, provider, provider_team_name)? {
            Some(existing) => {
                let mapped = self.repo.link_team_provider(
                    existing,
                    provider,
                    provider_team_id,
                    league,
                    provider_team_name,
                )?;
                debug!(
                    "{} team '{}' ({}) linked to canonical team {}",
                    provider, provider_team_name, provider_team_id, mapped
                );
                mapped
            }
            None => {
                let created = self.repo.create_team_with_mapping(
                    league,
                    provider_team_name,
                    abbreviation,
                    provider,
                    provider_team_id,
                )?;
                info!(
                    "New {} team '{}' (id {}) from {}",
                    league, provider_team_name, created, provider
                );
                created
            }
        };

        self.cache.insert(key, team_id);
        Ok(team_id)
    }

    /// Find the single canonical team a provider name confidently refers to.
    ///
    /// Teams this provider already maps under another id are not candidates:
    /// one provider never reports the same team under two ids.
    pub fn match_alias(&self, league: &str, provider: &str, name: &str) -> Result<Option<TeamId>> {
        let taken: BTreeSet<TeamId> = self
            .repo
            .teams_mapped_by_provider(league, provider)?
            .into_iter()
            .collect();
        let aliases: Vec<TeamAlias> = self
            .repo
            .team_aliases(league)?
            .into_iter()
            .filter(|a| !taken.contains(&a.team_id))
            .collect();
        Ok(pick_team(&aliases, name))
    }

    /// Every known name per team in the league.
    pub fn aliases_by_team(&self, league: &str) -> Result<HashMap<TeamId, Vec<String>>> {
        let mut by_team: HashMap<TeamId, Vec<String>> = HashMap::new();
        for alias in self.repo.team_aliases(league)? {
            by_team.entry(alias.team_id).or_default().push(alias.alias);
        }
        Ok(by_team)
    }

    /// Drop all cached mapping lookups.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }
}

/// Alias policy: any exact match wins; otherwise the longest alias contained
/// in the name; otherwise the name contained in exactly one team's aliases.
fn pick_team(aliases: &[TeamAlias], name: &str) -> Option<TeamId> {
    let exact: BTreeSet<TeamId> = aliases
        .iter()
        .filter(|a| match_names(&a.alias, name) == MatchConfidence::Exact)
        .map(|a| a.team_id)
        .collect();
    if let Some(&first) = exact.iter().next() {
        if exact.len() > 1 {
            warn!("Name '{}' exactly matches teams {:?}, using {}", name, exact, first);
        }
        return Some(first);
    }

    let mut contained: Vec<&TeamAlias> = aliases
        .iter()
        .filter(|a| alias_within(&a.alias, name))
        .collect();
    contained.sort_by_key(|a| std::cmp::Reverse(word_count(&a.alias)));
    if let Some(longest) = contained.first() {
        let top = word_count(&longest.alias);
        let teams: BTreeSet<TeamId> = contained
            .iter()
            .take_while(|a| word_count(&a.alias) == top)
            .map(|a| a.team_id)
            .collect();
        if teams.len() == 1 {
            return Some(longest.team_id);
        }
        warn!("Name '{}' is ambiguous between teams {:?}", name, teams);
        return None;
    }

    let containing: BTreeSet<TeamId> = aliases
        .iter()
        .filter(|a| alias_within(name, &a.alias))
        .map(|a| a.team_id)
        .collect();
    if containing.len() == 1 {
        return containing.into_iter().next();
    }
    if containing.len() > 1 {
        debug!("Name '{}' is contained in {} teams", name, containing.len());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TtlCache;
    use crate::db::Database;
    use std::time::Duration;

    fn resolver() -> (Arc<Database>, IdentityResolver) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let cache: Arc<TtlCache<MappingKey, TeamId>> =
            Arc::new(TtlCache::new(Duration::from_secs(300), 1000));
        (db.clone(), IdentityResolver::new(db, cache))
    }

    #[test]
    fn test_resolve_twice_returns_same_team() {
        let (db, ids) = resolver();
        let first = ids
            .resolve_or_create_team("NCAAM", "espn", "150", "Duke", Some("DUKE"))
            .unwrap();
        ids.clear_cache();
        let second = ids
            .resolve_or_create_team("NCAAM", "espn", "150", "Duke", Some("DUKE"))
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(db.count_teams("NCAAM").unwrap(), 1);
    }

    #[test]
    fn test_second_provider_attaches_by_alias() {
        let (db, ids) = resolver();
        let duke = ids
            .resolve_or_create_team("NCAAM", "espn", "150", "Duke", None)
            .unwrap();
        let other = ids
            .resolve_or_create_team("NCAAM", "odds_api", "Duke Blue Devils", "Duke Blue Devils", None)
            .unwrap();
        assert_eq!(duke, other);
        assert_eq!(db.count_teams("NCAAM").unwrap(), 1);
        // Display name stays with the first sighting.
        assert_eq!(db.get_team(duke).unwrap().unwrap().display_name, "Duke");
    }

    #[test]
    fn test_longest_alias_wins() {
        let (_db, ids) = resolver();
        let michigan = ids
            .resolve_or_create_team("NCAAM", "espn", "130", "Michigan", None)
            .unwrap();
        let michigan_state = ids
            .resolve_or_create_team("NCAAM", "espn", "127", "Michigan State", None)
            .unwrap();
        assert_ne!(michigan, michigan_state);
        let resolved = ids
            .resolve_or_create_team("NCAAM", "odds_api", "msu", "Michigan State Spartans", None)
            .unwrap();
        assert_eq!(resolved, michigan_state);
    }

    #[test]
    fn test_short_name_contained_in_one_alias() {
        let (_db, ids) = resolver();
        let unc = ids
            .resolve_or_create_team("NCAAM", "espn", "153", "North Carolina Tar Heels", None)
            .unwrap();
        let resolved = ids
            .resolve_or_create_team("NCAAM", "odds_api", "unc", "North Carolina", None)
            .unwrap();
        assert_eq!(resolved, unc);
    }

    #[test]
    fn test_ambiguous_short_name_creates_new_team() {
        let (db, ids) = resolver();
        ids.resolve_or_create_team("NCAAM", "espn", "66", "Iowa State Cyclones", None)
            .unwrap();
        ids.resolve_or_create_team("NCAAM", "espn", "127", "Michigan State Spartans", None)
            .unwrap();
        ids.resolve_or_create_team("NCAAM", "feed", "state", "State", None)
            .unwrap();
        assert_eq!(db.count_teams("NCAAM").unwrap(), 3);
    }

    #[test]
    fn test_partial_word_is_not_a_match() {
        let (db, ids) = resolver();
        let arkansas = ids
            .resolve_or_create_team("NCAAM", "espn", "8", "Arkansas", None)
            .unwrap();
        let kansas = ids
            .resolve_or_create_team("NCAAM", "espn", "2305", "Kansas", None)
            .unwrap();
        assert_ne!(arkansas, kansas);
        assert_eq!(db.count_teams("NCAAM").unwrap(), 2);
    }

    #[test]
    fn test_leagues_are_separate() {
        let (_db, ids) = resolver();
        let ncaam = ids
            .resolve_or_create_team("NCAAM", "espn", "150", "Duke", None)
            .unwrap();
        let ncaaf = ids
            .resolve_or_create_team("NCAAF", "espn", "150", "Duke", None)
            .unwrap();
        assert_ne!(ncaam, ncaaf);
    }

    #[test]
    fn test_raw_name_refreshed_on_mapping_hit() {
        let (db, ids) = resolver();
        ids.resolve_or_create_team("NBA", "espn", "2", "Boston Celtics", None)
            .unwrap();
        ids.clear_cache();
        ids.resolve_or_create_team("NBA", "espn", "2", "Celtics", None)
            .unwrap();
        let mapping = db.find_team_mapping("espn", "2", "NBA").unwrap().unwrap();
        assert_eq!(mapping.raw_name, "Celtics");
    }
}
