use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
#[error("{0} is not a valid House")]
pub struct ParseHouseError(pub String);

/// Enumeration of the houses a participant can be sorted into.
/// Stored in PostgreSQL as the `house` enum type.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "house")]
pub enum House {
    Gryffindor,
    Hufflepuff,
    Ravenclaw,
    Slytherin,
}

impl House {
    pub const ALL: [House; 4] = [
        House::Gryffindor,
        House::Hufflepuff,
        House::Ravenclaw,
        House::Slytherin,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            House::Gryffindor => "Gryffindor",
            House::Hufflepuff => "Hufflepuff",
            House::Ravenclaw => "Ravenclaw",
            House::Slytherin => "Slytherin",
        }
    }
}

impl fmt::Display for House {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Allow casting House from strings.
impl FromStr for House {
    type Err = ParseHouseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Gryffindor" => Ok(House::Gryffindor),
            "Hufflepuff" => Ok(House::Hufflepuff),
            "Ravenclaw" => Ok(House::Ravenclaw),
            "Slytherin" => Ok(House::Slytherin),
            invalid => Err(ParseHouseError(invalid.to_owned())),
        }
    }
}

/// Number of sorting results currently recorded for each house.
/// Always computed from the ledger, never kept around between allocations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Occupancy(HashMap<House, u64>);

impl Occupancy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, house: House) -> u64 {
        self.0.get(&house).copied().unwrap_or(0)
    }

    pub fn set(&mut self, house: House, count: u64) {
        self.0.insert(house, count);
    }

    pub fn increment(&mut self, house: House) {
        *self.0.entry(house).or_insert(0) += 1;
    }

    pub fn total(&self) -> u64 {
        self.0.values().sum()
    }
}

impl FromIterator<House> for Occupancy {
    fn from_iter<I: IntoIterator<Item = House>>(iter: I) -> Self {
        let mut occupancy = Occupancy::new();
        for house in iter {
            occupancy.increment(house);
        }
        occupancy
    }
}

/// The houses taking part in sorting and how many participants each one may hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Roster {
    capacities: Vec<(House, u64)>,
}

pub const DEFAULT_CAPACITY: u64 = 12;

impl Roster {
    /// A roster over the given houses. A house listed twice keeps its last capacity.
    pub fn new<I>(capacities: I) -> Self
    where
        I: IntoIterator<Item = (House, u64)>,
    {
        let mut roster = Self {
            capacities: Vec::new(),
        };
        for (house, capacity) in capacities {
            roster = roster.with_capacity(house, capacity);
        }
        roster
    }

    /// Every house with the same capacity.
    pub fn uniform(capacity: u64) -> Self {
        Self::new(House::ALL.iter().map(|house| (*house, capacity)))
    }

    pub fn with_capacity(mut self, house: House, capacity: u64) -> Self {
        match self.capacities.iter_mut().find(|(h, _)| *h == house) {
            Some(entry) => entry.1 = capacity,
            None => self.capacities.push((house, capacity)),
        }
        self
    }

    /// Capacity of a house, or None if it does not take part in sorting.
    pub fn capacity(&self, house: House) -> Option<u64> {
        self.capacities
            .iter()
            .find(|(h, _)| *h == house)
            .map(|(_, capacity)| *capacity)
    }

    pub fn houses(&self) -> impl Iterator<Item = House> + '_ {
        self.capacities.iter().map(|(house, _)| *house)
    }

    pub fn total_capacity(&self) -> u64 {
        self.capacities.iter().map(|(_, capacity)| capacity).sum()
    }

    /// Houses whose occupancy is still strictly below their capacity, in roster order.
    pub fn eligible(&self, occupancy: &Occupancy) -> Vec<House> {
        self.capacities
            .iter()
            .filter(|(house, capacity)| occupancy.get(*house) < *capacity)
            .map(|(house, _)| *house)
            .collect()
    }

    /// Pick a house uniformly among the eligible ones.
    /// Filtering happens before sampling, so full houses never skew the draw.
    pub fn choose<R: Rng + ?Sized>(&self, occupancy: &Occupancy, rng: &mut R) -> Option<House> {
        self.eligible(occupancy).choose(rng).copied()
    }
}

impl Default for Roster {
    fn default() -> Self {
        Self::uniform(DEFAULT_CAPACITY)
    }
}
