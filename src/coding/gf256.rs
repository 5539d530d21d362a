//! Arithmetic over GF(2^8) with primitive polynomial x^8 + x^4 + x^3 + x^2 + 1 (0x11D).
//! Log/antilog tables give O(1) multiply and inverse.

const fn gen_tables() -> ([u8; 256], [u8; 512]) {
    let mut log = [0u8; 256];
    let mut exp = [0u8; 512];
    let mut x: u16 = 1;
    let mut i = 0usize;
    while i < 255 {
        exp[i] = x as u8;
        exp[i + 255] = x as u8; // duplicated so lookups skip the mod 255
        log[x as usize] = i as u8;
        x <<= 1;
        if x & 0x100 != 0 {
            x ^= 0x11D;
        }
        i += 1;
    }
    (log, exp)
}

const TABLES: ([u8; 256], [u8; 512]) = gen_tables();
const LOG_TABLE: [u8; 256] = TABLES.0;
const EXP_TABLE: [u8; 512] = TABLES.1;

pub fn mul(a: u8, b: u8) -> u8 {
    if a == 0 || b == 0 {
        return 0;
    }
    EXP_TABLE[LOG_TABLE[a as usize] as usize + LOG_TABLE[b as usize] as usize]
}

/// Multiplicative inverse. Panics for 0, which has none - callers guarantee nonzero pivots.
pub fn inv(a: u8) -> u8 {
    assert_ne!(a, 0, "inverse of zero in GF(256)");
    EXP_TABLE[255 - LOG_TABLE[a as usize] as usize]
}

/// `acc += c * src` over GF(256), element-wise. Addition is XOR.
pub fn mul_acc(acc: &mut [u8], c: u8, src: &[u8]) {
    if c == 0 {
        return;
    }
    for (a, &s) in acc.iter_mut().zip(src) {
        *a ^= mul(c, s);
    }
}

/// `row *= c` element-wise.
pub fn scale(row: &mut [u8], c: u8) {
    for a in row.iter_mut() {
        *a = mul(*a, c);
    }
}
