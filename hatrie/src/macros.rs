/*
 * Created on Tue Feb 13 2024
 *
 * This file is a part of Hatrie
 * Hatrie is a free and open-source concurrent hash trie map keyed by raw
 * byte strings, designed for offset-based placement in custom memory
 * arenas and for deferred, staged reclamation.
 *
 * Copyright (c) 2024, the Hatrie developers
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 *
*/

macro_rules! flags {
    ($(#[$attr:meta])* $vis:vis struct $group:ident: $ty:ty { $($(#[$fattr:meta])* $flag:ident = $expr:expr),* $(,)? }) => {
        $(#[$attr])* $vis struct $group { r#const: $ty }
        #[allow(unused)]
        impl $group {
            $($(#[$fattr])* $vis const $flag: Self = Self { r#const: $expr };)*
            #[inline(always)]
            $vis const fn d(&self) -> $ty {
                self.r#const
            }
        }
    };
}
