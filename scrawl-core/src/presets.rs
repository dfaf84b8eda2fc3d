//! Stock prompts and status copy shared with front ends.

pub const EXAMPLE_PROMPTS: &[&str] = &[
    "A majestic lion in the African savanna, golden hour lighting, National Geographic photography style",
    "A cute cartoon cat sitting on a windowsill, Studio Ghibli animation style, soft pastel colors",
    "A futuristic sports car, sleek design, neon lighting, cyberpunk aesthetic, highly detailed",
    "A cozy cottage in an enchanted forest, fairy tale illustration, warm lighting, magical atmosphere",
    "A dragon flying over mountains, epic fantasy art, dramatic clouds, cinematic lighting",
    "A robot reading a book in a library, steampunk style, warm bronze tones, detailed machinery",
];

pub const EXAMPLE_EDITS: &[&str] = &[
    "Transform into a Van Gogh painting with swirling brushstrokes and vibrant colors",
    "Make it look like a watercolor painting with soft, flowing colors",
    "Add sunglasses and make it look cool and modern",
    "Change the background to a beautiful sunset with warm orange and pink colors",
    "Make it look like a pencil sketch with detailed shading",
    "Add magical sparkles and glowing effects around the subject",
    "Transform into anime/manga art style with bold colors and clean lines",
    "Make it look like a vintage photograph from the 1950s",
];

pub const SKETCH_HINT: &str = "Draw and generate your vision!";
pub const TRANSFORM_HINT: &str = "Generate an image first, then transform it!";
