// Anonymous identity generation.
//
// Every participant gets a throwaway display name and avatar tag at join
// time. Neither is tied to anything durable; the same person joining twice
// gets two unrelated identities.

use rand::Rng;

const ADJECTIVES: &[&str] = &[
    "Brave", "Calm", "Eager", "Fancy", "Gentle", "Happy", "Jolly", "Kind",
    "Lively", "Mighty", "Noble", "Polite", "Quiet", "Rapid", "Silly", "Witty",
    "Zealous", "Bright", "Clever", "Daring", "Elated", "Fierce", "Graceful", "Honest",
];

const NOUNS: &[&str] = &[
    "Bear", "Cat", "Dolphin", "Eagle", "Fox", "Giraffe", "Horse", "Ibex",
    "Jaguar", "Koala", "Lion", "Monkey", "Narwhal", "Owl", "Panda", "Rabbit",
    "Squirrel", "Tiger", "Unicorn", "Vulture", "Wolf", "Zebra", "Falcon", "Hedgehog",
];

const COLORS: &[&str] = &[
    "red", "blue", "green", "yellow", "purple", "orange", "teal", "pink",
    "cyan", "magenta", "lime", "indigo", "violet", "gold", "silver", "maroon",
];

/// Shapes are addressed by index: 1=circle, 2=square, 3=triangle, 4=star,
/// 5=diamond, 6=hexagon. Clients render them; the relay only hands out tags.
const SHAPE_COUNT: u32 = 6;

/// A freshly generated anonymous identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub display_name: String,
    pub avatar_tag: String,
}

/// Supplies a random display name and avatar tag per connecting participant.
///
/// Injected into the registry so tests can substitute a scripted provider.
pub trait IdentityProvider: Send + Sync {
    fn generate(&self) -> Identity;
}

/// Production provider backed by the thread-local RNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomIdentityProvider;

impl IdentityProvider for RandomIdentityProvider {
    fn generate(&self) -> Identity {
        let mut rng = rand::thread_rng();

        let adjective = ADJECTIVES[rng.gen_range(0..ADJECTIVES.len())];
        let noun = NOUNS[rng.gen_range(0..NOUNS.len())];
        let display_name = format!("{adjective}{noun}");

        let color = COLORS[rng.gen_range(0..COLORS.len())];
        let shape = rng.gen_range(1..=SHAPE_COUNT);
        // Foreground and background must differ for the avatar to read.
        let bg_color = loop {
            let candidate = COLORS[rng.gen_range(0..COLORS.len())];
            if candidate != color {
                break candidate;
            }
        };
        let avatar_tag = format!("{color}-{shape}-{bg_color}");

        Identity { display_name, avatar_tag }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_name_is_adjective_noun_pair() {
        let identity = RandomIdentityProvider.generate();
        assert!(ADJECTIVES.iter().any(|a| identity.display_name.starts_with(a)));
        assert!(NOUNS.iter().any(|n| identity.display_name.ends_with(n)));
    }

    #[test]
    fn avatar_tag_has_color_shape_color_form() {
        for _ in 0..100 {
            let identity = RandomIdentityProvider.generate();
            let parts: Vec<&str> = identity.avatar_tag.split('-').collect();
            assert_eq!(parts.len(), 3, "tag {} should have three parts", identity.avatar_tag);
            assert!(COLORS.contains(&parts[0]));
            let shape: u32 = parts[1].parse().expect("shape should be numeric");
            assert!((1..=SHAPE_COUNT).contains(&shape));
            assert!(COLORS.contains(&parts[2]));
        }
    }

    #[test]
    fn avatar_foreground_never_matches_background() {
        for _ in 0..200 {
            let identity = RandomIdentityProvider.generate();
            let parts: Vec<&str> = identity.avatar_tag.split('-').collect();
            assert_ne!(parts[0], parts[2]);
        }
    }
}
